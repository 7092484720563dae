use super::types::{
    is_reference_tag, JdwpError, JdwpIdSizes, JdwpValue, Location, ObjectId, ReferenceTypeId,
    Result, TAG_BOOLEAN, TAG_BYTE, TAG_CHAR, TAG_DOUBLE, TAG_FLOAT, TAG_INT, TAG_LONG, TAG_SHORT,
    TAG_VOID,
};
use crate::{JDWP_HEADER_LEN, MAX_PACKET_LEN};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";
pub const FLAG_REPLY: u8 = 0x80;

/// First character of a field/method type signature, which doubles as the
/// JDWP tag for primitives (`I`, `J`, ...) and for plain objects (`L`) and
/// arrays (`[`).
pub fn signature_to_tag(signature: &str) -> u8 {
    signature.as_bytes().first().copied().unwrap_or(TAG_VOID)
}

/// `Lcom/example/Foo;` becomes `com.example.Foo`. Array and primitive
/// signatures are returned unchanged.
pub fn signature_to_class_name(signature: &str) -> String {
    match signature
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
    {
        Some(internal) => internal.replace('/', "."),
        None => signature.to_string(),
    }
}

#[derive(Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
}

impl JdwpWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        // JDWP strings are length-prefixed with a u32 number of (modified) UTF-8 bytes.
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// DDM chunks carry strings as a `u32` count of UTF-16 code units followed
    /// by the big-endian code units.
    pub fn write_utf16_string(&mut self, s: &str) {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.write_u32(units.len() as u32);
        for unit in units {
            self.write_u16(unit);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Overwrite a previously written big-endian `u32` at `offset` (used for
    /// offsets that are only known once the body has been written).
    pub fn patch_u32(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn write_id(&mut self, id: u64, size: usize) {
        let be = id.to_be_bytes();
        self.buf.extend_from_slice(&be[8 - size..]);
    }

    pub fn write_object_id(&mut self, id: ObjectId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.object_id);
    }

    pub fn write_reference_type_id(&mut self, id: ReferenceTypeId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.reference_type_id);
    }

    pub fn write_location(&mut self, loc: &Location, sizes: &JdwpIdSizes) {
        self.write_u8(loc.type_tag);
        self.write_reference_type_id(loc.class_id, sizes);
        self.write_id(loc.method_id, sizes.method_id);
        self.write_u64(loc.index);
    }

    /// Untagged value payload (array regions and replies where the tag is
    /// implied by the declared type).
    pub fn write_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        match *v {
            JdwpValue::Boolean(v) => self.write_bool(v),
            JdwpValue::Byte(v) => self.write_u8(v as u8),
            JdwpValue::Char(v) => self.write_u16(v),
            JdwpValue::Short(v) => self.write_i16(v),
            JdwpValue::Int(v) => self.write_i32(v),
            JdwpValue::Long(v) => self.write_i64(v),
            JdwpValue::Float(v) => self.write_f32(v),
            JdwpValue::Double(v) => self.write_f64(v),
            JdwpValue::Object { id, .. } => self.write_object_id(id, sizes),
            JdwpValue::Void => {}
        }
    }

    pub fn write_tagged_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        self.write_u8(v.tag());
        self.write_value(v, sizes);
    }
}

pub struct JdwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn require(&self, n: usize) -> Result<()> {
        let end = self.pos.checked_add(n).ok_or_else(|| self.underflow(n))?;
        if end > self.buf.len() {
            return Err(self.underflow(n));
        }
        Ok(())
    }

    fn underflow(&self, n: usize) -> JdwpError {
        JdwpError::Protocol(format!(
            "buffer underflow: need {n} bytes at {}, have {}",
            self.pos,
            self.buf.len()
        ))
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.require(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| {
            JdwpError::Protocol(format!("unable to allocate string buffer ({len} bytes)"))
        })?;
        out.extend_from_slice(bytes);
        String::from_utf8(out)
            .map_err(|e| JdwpError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.require(len)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_id(&mut self, size: usize) -> Result<u64> {
        if size == 0 || size > 8 {
            return Err(JdwpError::Protocol(format!("invalid id size: {size}")));
        }
        self.require(size)?;
        let mut be = [0u8; 8];
        be[8 - size..].copy_from_slice(&self.buf[self.pos..self.pos + size]);
        self.pos += size;
        Ok(u64::from_be_bytes(be))
    }

    pub fn read_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<ObjectId> {
        self.read_id(sizes.object_id)
    }

    pub fn read_reference_type_id(&mut self, sizes: &JdwpIdSizes) -> Result<ReferenceTypeId> {
        self.read_id(sizes.reference_type_id)
    }

    pub fn read_location(&mut self, sizes: &JdwpIdSizes) -> Result<Location> {
        Ok(Location {
            type_tag: self.read_u8()?,
            class_id: self.read_reference_type_id(sizes)?,
            method_id: self.read_id(sizes.method_id)?,
            index: self.read_u64()?,
        })
    }

    pub fn read_value(&mut self, tag: u8, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let v = match tag {
            TAG_BOOLEAN => JdwpValue::Boolean(self.read_bool()?),
            TAG_BYTE => JdwpValue::Byte(self.read_u8()? as i8),
            TAG_CHAR => JdwpValue::Char(self.read_u16()?),
            TAG_SHORT => JdwpValue::Short(self.read_i16()?),
            TAG_INT => JdwpValue::Int(self.read_i32()?),
            TAG_LONG => JdwpValue::Long(self.read_i64()?),
            TAG_FLOAT => JdwpValue::Float(self.read_f32()?),
            TAG_DOUBLE => JdwpValue::Double(self.read_f64()?),
            TAG_VOID => JdwpValue::Void,
            tag if is_reference_tag(tag) => JdwpValue::Object {
                tag,
                id: self.read_object_id(sizes)?,
            },
            other => return Err(JdwpError::InvalidTag(other)),
        };
        Ok(v)
    }

    pub fn read_tagged_value(&mut self, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let tag = self.read_u8()?;
        self.read_value(tag, sizes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub id: u32,
    pub command_set: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPacket {
    pub id: u32,
    pub error_code: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Command(CommandPacket),
    Reply(ReplyPacket),
}

impl Packet {
    pub fn id(&self) -> u32 {
        match self {
            Packet::Command(cmd) => cmd.id,
            Packet::Reply(reply) => reply.id,
        }
    }
}

pub(crate) struct Header {
    pub length: usize,
    pub id: u32,
    pub flags: u8,
    pub tail: [u8; 2],
}

pub(crate) fn decode_header(header: &[u8; JDWP_HEADER_LEN]) -> Result<Header> {
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length < JDWP_HEADER_LEN {
        return Err(JdwpError::Protocol(format!(
            "packet length {length} is shorter than the header"
        )));
    }
    if length > MAX_PACKET_LEN {
        return Err(JdwpError::Protocol(format!(
            "packet length {length} exceeds limit {MAX_PACKET_LEN}"
        )));
    }
    Ok(Header {
        length,
        id: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        flags: header[8],
        tail: [header[9], header[10]],
    })
}

pub(crate) fn assemble(header: Header, payload: Vec<u8>) -> Packet {
    if header.flags & FLAG_REPLY != 0 {
        Packet::Reply(ReplyPacket {
            id: header.id,
            error_code: u16::from_be_bytes(header.tail),
            payload,
        })
    } else {
        Packet::Command(CommandPacket {
            id: header.id,
            command_set: header.tail[0],
            command: header.tail[1],
            payload,
        })
    }
}

/// Decode exactly one packet from `bytes` (header plus payload, nothing else).
pub fn decode_packet_bytes(bytes: &[u8]) -> Result<Packet> {
    let header: &[u8; JDWP_HEADER_LEN] = bytes
        .get(..JDWP_HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| JdwpError::Protocol(format!("short packet ({} bytes)", bytes.len())))?;
    let header = decode_header(header)?;
    if header.length != bytes.len() {
        return Err(JdwpError::Protocol(format!(
            "packet length {} does not match buffer length {}",
            header.length,
            bytes.len()
        )));
    }
    Ok(assemble(header, bytes[JDWP_HEADER_LEN..].to_vec()))
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let length = (JDWP_HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(0); // flags
    out.push(command_set);
    out.push(command);
    out.extend_from_slice(payload);
    out
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    let length = (JDWP_HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(FLAG_REPLY);
    out.extend_from_slice(&error_code.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TAG_OBJECT, TAG_STRING};

    #[test]
    fn signature_to_class_name_keeps_arrays() {
        assert_eq!(signature_to_class_name("Lcom/example/Foo;"), "com.example.Foo");
        assert_eq!(signature_to_class_name("[I"), "[I");
    }

    #[test]
    fn ids_are_truncated_to_the_negotiated_width() {
        let sizes = JdwpIdSizes::uniform(4);
        let mut w = JdwpWriter::new();
        w.write_object_id(0x1122_3344_5566_7788, &sizes);
        assert_eq!(w.into_vec(), vec![0x55, 0x66, 0x77, 0x88]);
    }

    #[test]
    fn reader_rejects_unknown_tags_and_underflow() {
        let sizes = JdwpIdSizes::default();
        let mut r = JdwpReader::new(&[b'Q', 0, 0]);
        assert!(matches!(
            r.read_tagged_value(&sizes),
            Err(JdwpError::InvalidTag(b'Q'))
        ));

        let mut r = JdwpReader::new(&[0, 0, 0, 9, b'a']);
        assert!(matches!(r.read_string(), Err(JdwpError::Protocol(_))));
    }

    #[test]
    fn tagged_string_reference_keeps_its_tag() {
        let sizes = JdwpIdSizes::default();
        let mut w = JdwpWriter::new();
        w.write_tagged_value(&JdwpValue::Object { tag: TAG_STRING, id: 7 }, &sizes);
        w.write_tagged_value(&JdwpValue::null(), &sizes);
        let bytes = w.into_vec();

        let mut r = JdwpReader::new(&bytes);
        assert_eq!(
            r.read_tagged_value(&sizes).unwrap(),
            JdwpValue::Object { tag: TAG_STRING, id: 7 }
        );
        assert_eq!(
            r.read_tagged_value(&sizes).unwrap(),
            JdwpValue::Object { tag: TAG_OBJECT, id: 0 }
        );
        assert!(r.is_empty());
    }

    #[test]
    fn decodes_replies_and_commands_from_raw_bytes() {
        let reply = encode_reply(9, 20, &[1, 2]);
        assert_eq!(
            decode_packet_bytes(&reply).unwrap(),
            Packet::Reply(ReplyPacket {
                id: 9,
                error_code: 20,
                payload: vec![1, 2],
            })
        );

        let command = encode_command(3, 1, 7, &[]);
        assert_eq!(
            decode_packet_bytes(&command).unwrap(),
            Packet::Command(CommandPacket {
                id: 3,
                command_set: 1,
                command: 7,
                payload: Vec::new(),
            })
        );

        assert!(decode_packet_bytes(&command[..5]).is_err());
        let mut bogus = command.clone();
        bogus[3] = 2; // length < header
        assert!(decode_packet_bytes(&bogus).is_err());
    }
}
