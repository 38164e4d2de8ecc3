//! Hand-rolled DICOM command-set encoding/decoding (PS3.7) for C-STORE and
//! C-ECHO, and the DICOM status-class classification used to turn a peer's
//! response into a retryable/permanent forwarding outcome. `dicom-ul` speaks
//! the upper-layer protocol (associations, PDUs, PDVs) but has no opinion on
//! what bytes ride inside a Command PDV; that's what this crate builds.
//!
//! Command sets are always Implicit VR Little Endian (1.2.840.10008.1.2),
//! independent of whichever transfer syntax was negotiated for the data set
//! that follows.

mod command;
mod status;

pub use command::{
    peek_command_field, CEchoRequest, CEchoResponse, CStoreRequest, CStoreResponse, CommandError,
    Priority, C_ECHO_RQ, C_STORE_RQ,
};
pub use status::{classify, StatusClass};
