//! Command set (group 0000) elements for C-STORE and C-ECHO, encoded and
//! decoded as Implicit VR Little Endian per PS3.7 Annex E / PS3.5 Annex A.1.

const GROUP: u16 = 0x0000;
const ELEM_GROUP_LENGTH: u16 = 0x0000;
const ELEM_AFFECTED_SOP_CLASS_UID: u16 = 0x0002;
const ELEM_COMMAND_FIELD: u16 = 0x0100;
const ELEM_MESSAGE_ID: u16 = 0x0110;
const ELEM_MESSAGE_ID_BEING_RESPONDED_TO: u16 = 0x0120;
const ELEM_PRIORITY: u16 = 0x0700;
const ELEM_COMMAND_DATA_SET_TYPE: u16 = 0x0800;
const ELEM_STATUS: u16 = 0x0900;
const ELEM_AFFECTED_SOP_INSTANCE_UID: u16 = 0x1000;

const COMMAND_FIELD_C_STORE_RQ: u16 = 0x0001;
const COMMAND_FIELD_C_STORE_RSP: u16 = 0x8001;
const COMMAND_FIELD_C_ECHO_RQ: u16 = 0x0030;
const COMMAND_FIELD_C_ECHO_RSP: u16 = 0x8030;

/// Command Field value for C-STORE-RQ, exposed so a dispatcher can route a
/// peeked command set before decoding it in full.
pub const C_STORE_RQ: u16 = COMMAND_FIELD_C_STORE_RQ;
/// Command Field value for C-ECHO-RQ.
pub const C_ECHO_RQ: u16 = COMMAND_FIELD_C_ECHO_RQ;

/// Sentinel value of (0000,0800) meaning "no data set follows". Any other
/// value means a data set is present; C-STORE-RQ always sets this to
/// something other than this sentinel, and every response here sets it.
const DATA_SET_TYPE_NONE: u16 = 0x0101;
const DATA_SET_TYPE_PRESENT: u16 = 0x0000;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command set is truncated: expected at least {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("command set is missing required element ({group:04X},{element:04X})")]
    MissingElement { group: u16, element: u16 },
    #[error("command field {0:#06X} does not match the expected message type")]
    UnexpectedCommandField(u16),
}

type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    fn to_u16(self) -> u16 {
        match self {
            Priority::Low => 0x0002,
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
        }
    }

    fn from_u16(v: u16) -> Self {
        match v {
            0x0001 => Priority::High,
            0x0002 => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStoreRequest {
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub message_id: u16,
    pub priority: Priority,
}

impl CStoreRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut elements = Vec::new();
        push_ui(&mut elements, ELEM_AFFECTED_SOP_CLASS_UID, &self.affected_sop_class_uid);
        push_us(&mut elements, ELEM_COMMAND_FIELD, COMMAND_FIELD_C_STORE_RQ);
        push_us(&mut elements, ELEM_MESSAGE_ID, self.message_id);
        push_us(&mut elements, ELEM_PRIORITY, self.priority.to_u16());
        push_us(&mut elements, ELEM_COMMAND_DATA_SET_TYPE, DATA_SET_TYPE_PRESENT);
        push_ui(&mut elements, ELEM_AFFECTED_SOP_INSTANCE_UID, &self.affected_sop_instance_uid);
        finish(elements)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let elements = parse_elements(bytes)?;
        let command_field = require_us(&elements, ELEM_COMMAND_FIELD)?;
        if command_field != COMMAND_FIELD_C_STORE_RQ {
            return Err(CommandError::UnexpectedCommandField(command_field));
        }
        Ok(CStoreRequest {
            affected_sop_class_uid: require_ui(&elements, ELEM_AFFECTED_SOP_CLASS_UID)?,
            affected_sop_instance_uid: require_ui(&elements, ELEM_AFFECTED_SOP_INSTANCE_UID)?,
            message_id: require_us(&elements, ELEM_MESSAGE_ID)?,
            priority: Priority::from_u16(require_us(&elements, ELEM_PRIORITY)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CStoreResponse {
    pub affected_sop_class_uid: String,
    pub affected_sop_instance_uid: String,
    pub message_id_being_responded_to: u16,
    pub status: u16,
}

impl CStoreResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut elements = Vec::new();
        push_ui(&mut elements, ELEM_AFFECTED_SOP_CLASS_UID, &self.affected_sop_class_uid);
        push_us(&mut elements, ELEM_COMMAND_FIELD, COMMAND_FIELD_C_STORE_RSP);
        push_us(&mut elements, ELEM_MESSAGE_ID_BEING_RESPONDED_TO, self.message_id_being_responded_to);
        push_us(&mut elements, ELEM_COMMAND_DATA_SET_TYPE, DATA_SET_TYPE_NONE);
        push_us(&mut elements, ELEM_STATUS, self.status);
        push_ui(&mut elements, ELEM_AFFECTED_SOP_INSTANCE_UID, &self.affected_sop_instance_uid);
        finish(elements)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let elements = parse_elements(bytes)?;
        let command_field = require_us(&elements, ELEM_COMMAND_FIELD)?;
        if command_field != COMMAND_FIELD_C_STORE_RSP {
            return Err(CommandError::UnexpectedCommandField(command_field));
        }
        Ok(CStoreResponse {
            affected_sop_class_uid: require_ui(&elements, ELEM_AFFECTED_SOP_CLASS_UID)?,
            affected_sop_instance_uid: find_ui(&elements, ELEM_AFFECTED_SOP_INSTANCE_UID).unwrap_or_default(),
            message_id_being_responded_to: require_us(&elements, ELEM_MESSAGE_ID_BEING_RESPONDED_TO)?,
            status: require_us(&elements, ELEM_STATUS)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEchoRequest {
    pub affected_sop_class_uid: String,
    pub message_id: u16,
}

impl CEchoRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut elements = Vec::new();
        push_ui(&mut elements, ELEM_AFFECTED_SOP_CLASS_UID, &self.affected_sop_class_uid);
        push_us(&mut elements, ELEM_COMMAND_FIELD, COMMAND_FIELD_C_ECHO_RQ);
        push_us(&mut elements, ELEM_MESSAGE_ID, self.message_id);
        push_us(&mut elements, ELEM_COMMAND_DATA_SET_TYPE, DATA_SET_TYPE_NONE);
        finish(elements)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let elements = parse_elements(bytes)?;
        let command_field = require_us(&elements, ELEM_COMMAND_FIELD)?;
        if command_field != COMMAND_FIELD_C_ECHO_RQ {
            return Err(CommandError::UnexpectedCommandField(command_field));
        }
        Ok(CEchoRequest {
            affected_sop_class_uid: require_ui(&elements, ELEM_AFFECTED_SOP_CLASS_UID)?,
            message_id: require_us(&elements, ELEM_MESSAGE_ID)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CEchoResponse {
    pub affected_sop_class_uid: String,
    pub message_id_being_responded_to: u16,
    pub status: u16,
}

impl CEchoResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut elements = Vec::new();
        push_ui(&mut elements, ELEM_AFFECTED_SOP_CLASS_UID, &self.affected_sop_class_uid);
        push_us(&mut elements, ELEM_COMMAND_FIELD, COMMAND_FIELD_C_ECHO_RSP);
        push_us(&mut elements, ELEM_MESSAGE_ID_BEING_RESPONDED_TO, self.message_id_being_responded_to);
        push_us(&mut elements, ELEM_COMMAND_DATA_SET_TYPE, DATA_SET_TYPE_NONE);
        push_us(&mut elements, ELEM_STATUS, self.status);
        finish(elements)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let elements = parse_elements(bytes)?;
        let command_field = require_us(&elements, ELEM_COMMAND_FIELD)?;
        if command_field != COMMAND_FIELD_C_ECHO_RSP {
            return Err(CommandError::UnexpectedCommandField(command_field));
        }
        Ok(CEchoResponse {
            affected_sop_class_uid: require_ui(&elements, ELEM_AFFECTED_SOP_CLASS_UID)?,
            message_id_being_responded_to: require_us(&elements, ELEM_MESSAGE_ID_BEING_RESPONDED_TO)?,
            status: require_us(&elements, ELEM_STATUS)?,
        })
    }
}

/// Reads just the Command Field (0000,0100) out of a command set, so a
/// caller can dispatch to the right request type before committing to a
/// full decode.
pub fn peek_command_field(bytes: &[u8]) -> Result<u16> {
    let elements = parse_elements(bytes)?;
    require_us(&elements, ELEM_COMMAND_FIELD)
}

type RawElements = std::collections::HashMap<u16, Vec<u8>>;

fn push_ui(elements: &mut Vec<(u16, u16, Vec<u8>)>, element: u16, uid: &str) {
    let mut value = uid.as_bytes().to_vec();
    if value.len() % 2 != 0 {
        value.push(0);
    }
    elements.push((GROUP, element, value));
}

fn push_us(elements: &mut Vec<(u16, u16, Vec<u8>)>, element: u16, value: u16) {
    elements.push((GROUP, element, value.to_le_bytes().to_vec()));
}

/// Serializes `elements` preceded by a computed (0000,0000) CommandGroupLength.
fn finish(elements: Vec<(u16, u16, Vec<u8>)>) -> Vec<u8> {
    let body_len: usize = elements.iter().map(|(_, _, v)| 8 + v.len()).sum();
    let mut buf = Vec::with_capacity(12 + body_len);
    write_element(&mut buf, GROUP, ELEM_GROUP_LENGTH, &(body_len as u32).to_le_bytes());
    for (group, element, value) in elements {
        write_element(&mut buf, group, element, &value);
    }
    buf
}

fn write_element(buf: &mut Vec<u8>, group: u16, element: u16, value: &[u8]) {
    buf.extend_from_slice(&group.to_le_bytes());
    buf.extend_from_slice(&element.to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
}

fn parse_elements(bytes: &[u8]) -> Result<RawElements> {
    let mut elements = RawElements::new();
    let mut offset = 0usize;
    while offset + 8 <= bytes.len() {
        let element = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]);
        let len = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        offset += 8;
        if offset + len > bytes.len() {
            return Err(CommandError::Truncated { expected: offset + len, found: bytes.len() });
        }
        elements.insert(element, bytes[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(elements)
}

fn require_us(elements: &RawElements, element: u16) -> Result<u16> {
    let value = elements
        .get(&element)
        .ok_or(CommandError::MissingElement { group: GROUP, element })?;
    if value.len() < 2 {
        return Err(CommandError::Truncated { expected: 2, found: value.len() });
    }
    Ok(u16::from_le_bytes([value[0], value[1]]))
}

fn require_ui(elements: &RawElements, element: u16) -> Result<String> {
    find_ui(elements, element).ok_or(CommandError::MissingElement { group: GROUP, element })
}

fn find_ui(elements: &RawElements, element: u16) -> Option<String> {
    elements.get(&element).map(|value| {
        std::str::from_utf8(value)
            .unwrap_or_default()
            .trim_end_matches('\0')
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_store_request_round_trips() {
        let req = CStoreRequest {
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            affected_sop_instance_uid: "1.2.3.4.5".to_string(),
            message_id: 7,
            priority: Priority::Medium,
        };
        let encoded = req.encode();
        assert_eq!(CStoreRequest::decode(&encoded).unwrap(), req);
    }

    #[test]
    fn c_store_response_round_trips_with_odd_length_uid() {
        let rsp = CStoreResponse {
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            affected_sop_instance_uid: "1.2.3".to_string(),
            message_id_being_responded_to: 7,
            status: 0x0000,
        };
        let encoded = rsp.encode();
        // UID padding keeps every element length even.
        assert_eq!(encoded.len() % 2, 0);
        assert_eq!(CStoreResponse::decode(&encoded).unwrap(), rsp);
    }

    #[test]
    fn c_echo_round_trips() {
        let req = CEchoRequest { affected_sop_class_uid: "1.2.840.10008.1.1".to_string(), message_id: 1 };
        let encoded = req.encode();
        assert_eq!(CEchoRequest::decode(&encoded).unwrap(), req);

        let rsp = CEchoResponse {
            affected_sop_class_uid: "1.2.840.10008.1.1".to_string(),
            message_id_being_responded_to: 1,
            status: 0x0000,
        };
        let encoded = rsp.encode();
        assert_eq!(CEchoResponse::decode(&encoded).unwrap(), rsp);
    }

    #[test]
    fn decode_rejects_wrong_command_field() {
        let echo = CEchoRequest { affected_sop_class_uid: "1.2.840.10008.1.1".to_string(), message_id: 1 }.encode();
        assert!(matches!(CStoreRequest::decode(&echo), Err(CommandError::UnexpectedCommandField(_))));
    }

    #[test]
    fn peek_command_field_identifies_request_type_without_full_decode() {
        let echo = CEchoRequest { affected_sop_class_uid: "1.2.840.10008.1.1".to_string(), message_id: 1 }.encode();
        assert_eq!(peek_command_field(&echo).unwrap(), C_ECHO_RQ);

        let store = CStoreRequest {
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            affected_sop_instance_uid: "1.2.3".to_string(),
            message_id: 1,
            priority: Priority::Medium,
        }
        .encode();
        assert_eq!(peek_command_field(&store).unwrap(), C_STORE_RQ);
    }

    #[test]
    fn decode_rejects_truncated_bytes() {
        // A header claiming a 10-byte value with none actually present.
        let truncated = [0x00, 0x00, 0x02, 0x00, 0x0A, 0x00, 0x00, 0x00];
        assert!(matches!(CStoreRequest::decode(&truncated), Err(CommandError::Truncated { .. })));
    }
}
