//! Typed binary records and the record schema registry.
//!
//! Every record type posted to the output queue is registered by name
//! with an ordered list of field definitions, so consumers can decode
//! frames without compiled-in knowledge of the layouts. Fixed-layout
//! portions are `#[repr(C, packed)]` structs serialized with [zerocopy];
//! a trailing field with `count == 0` is a variable-length batch whose
//! element type may itself be a registered record.
//!
//! The wire format proper belongs to the transport layer; the frames
//! assembled here are a minimal length-prefixed type name followed by the
//! record payload.

use crate::error::Severity;

use bytes::{BufMut, Bytes, BytesMut};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::mem::{offset_of, size_of};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Record type names.
pub const EXTENT_REC_TYPE: &str = "atl03rec";
pub const PHOTON_REC_TYPE: &str = "atl03rec.photons";
pub const ANC_ELEMENT_REC_TYPE: &str = "ancelementrec";
pub const EXCEPTION_REC_TYPE: &str = "exceptrec";
pub const CONTAINER_REC_TYPE: &str = "containerrec";

/// Scalar type of a registered record field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    /// Nanosecond timestamp carried as an i64.
    Time8,
    /// A nested record; `subtype` names it.
    User,
}

/// Field flags.
pub const FIELD_FLAG_NONE: u8 = 0x00;
/// The field is a trailing batch array of its subtype.
pub const FIELD_FLAG_BATCH: u8 = 0x01;

/// One field of a registered record type.
#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: &'static str,
    pub ftype: FieldType,
    pub offset: usize,
    /// Element count; 0 marks a variable-length trailing field.
    pub count: usize,
    pub subtype: Option<&'static str>,
    pub flags: u8,
}

/// A registered record type.
#[derive(Clone, Debug)]
pub struct RecordSchema {
    pub rec_type: &'static str,
    /// Size of the fixed-layout portion in bytes.
    pub fixed_size: usize,
    pub fields: Vec<FieldDef>,
}

/// One photon of an extent, in primary-granule index order.
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, PartialEq)]
#[repr(C, packed)]
pub struct PhotonRecord {
    /// Unix timestamp in nanoseconds.
    pub time_ns: i64,
    pub latitude: f64,
    pub longitude: f64,
    /// Along-track distance relative to the extent center.
    pub x_atc: f32,
    pub y_atc: f32,
    pub height: f32,
    pub relief: f32,
    pub landcover: u8,
    pub snowcover: u8,
    pub atl08_class: u8,
    pub atl03_cnf: i8,
    pub quality_ph: i8,
    pub yapc_score: u8,
}

/// Fixed-layout header of an extent record; followed by a batch of
/// [PhotonRecord].
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, PartialEq)]
#[repr(C, packed)]
pub struct ExtentHeader {
    pub extent_id: u64,
    pub rgt: u16,
    pub cycle: u16,
    pub segment_id: u32,
    /// Along-track distance of the extent center from the equator.
    pub segment_distance: f64,
    pub extent_length: f64,
    pub background_rate: f64,
    pub solar_elevation: f32,
    pub spacecraft_velocity: f32,
    pub track: u8,
    pub pair: u8,
    pub sc_orient: u8,
    pub valid: u8,
    pub photon_count: u32,
}

/// Ancillary data source a record's elements were taken from.
pub const ANC_TYPE_PHOTON: u8 = 0;
pub const ANC_TYPE_EXTENT: u8 = 1;
pub const ANC_TYPE_ATL08: u8 = 2;

/// Fixed-layout header of an ancillary element-array record; followed by
/// `num_elements` raw little-endian elements of `data_type`.
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, PartialEq)]
#[repr(C, packed)]
pub struct AncElementHeader {
    pub extent_id: u64,
    pub num_elements: u32,
    pub anc_type: u8,
    pub field_index: u8,
    pub data_type: u8,
}

/// Fixed-layout header of an exception record; followed by the message
/// text.
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, PartialEq)]
#[repr(C, packed)]
pub struct ExceptionHeader {
    pub code: i32,
    pub level: u8,
}

impl Severity {
    /// Wire encoding used in exception records.
    pub fn level(&self) -> u8 {
        match self {
            Severity::Debug => 0,
            Severity::Error => 1,
            Severity::Critical => 2,
        }
    }
}

lazy_static! {
    static ref REGISTRY: HashMap<&'static str, RecordSchema> = {
        let mut map = HashMap::new();
        register(&mut map, photon_schema());
        register(&mut map, extent_schema());
        register(&mut map, anc_element_schema());
        register(&mut map, exception_schema());
        register(&mut map, container_schema());
        map
    };
}

fn register(map: &mut HashMap<&'static str, RecordSchema>, schema: RecordSchema) {
    map.insert(schema.rec_type, schema);
}

/// Look up a registered record schema by type name.
pub fn schema(rec_type: &str) -> Option<&'static RecordSchema> {
    REGISTRY.get(rec_type)
}

fn photon_schema() -> RecordSchema {
    let fields = vec![
        field("time", FieldType::Time8, offset_of!(PhotonRecord, time_ns)),
        field("latitude", FieldType::Double, offset_of!(PhotonRecord, latitude)),
        field("longitude", FieldType::Double, offset_of!(PhotonRecord, longitude)),
        field("x_atc", FieldType::Float, offset_of!(PhotonRecord, x_atc)),
        field("y_atc", FieldType::Float, offset_of!(PhotonRecord, y_atc)),
        field("height", FieldType::Float, offset_of!(PhotonRecord, height)),
        field("relief", FieldType::Float, offset_of!(PhotonRecord, relief)),
        field("landcover", FieldType::UInt8, offset_of!(PhotonRecord, landcover)),
        field("snowcover", FieldType::UInt8, offset_of!(PhotonRecord, snowcover)),
        field("atl08_class", FieldType::UInt8, offset_of!(PhotonRecord, atl08_class)),
        field("atl03_cnf", FieldType::Int8, offset_of!(PhotonRecord, atl03_cnf)),
        field("quality_ph", FieldType::Int8, offset_of!(PhotonRecord, quality_ph)),
        field("yapc_score", FieldType::UInt8, offset_of!(PhotonRecord, yapc_score)),
    ];
    RecordSchema {
        rec_type: PHOTON_REC_TYPE,
        fixed_size: size_of::<PhotonRecord>(),
        fields,
    }
}

fn extent_schema() -> RecordSchema {
    let fields = vec![
        field("extent_id", FieldType::UInt64, offset_of!(ExtentHeader, extent_id)),
        field("rgt", FieldType::UInt16, offset_of!(ExtentHeader, rgt)),
        field("cycle", FieldType::UInt16, offset_of!(ExtentHeader, cycle)),
        field("segment_id", FieldType::UInt32, offset_of!(ExtentHeader, segment_id)),
        field("segment_dist", FieldType::Double, offset_of!(ExtentHeader, segment_distance)),
        field("extent_length", FieldType::Double, offset_of!(ExtentHeader, extent_length)),
        field("background_rate", FieldType::Double, offset_of!(ExtentHeader, background_rate)),
        field("solar_elevation", FieldType::Float, offset_of!(ExtentHeader, solar_elevation)),
        field("sc_velocity", FieldType::Float, offset_of!(ExtentHeader, spacecraft_velocity)),
        field("track", FieldType::UInt8, offset_of!(ExtentHeader, track)),
        field("pair", FieldType::UInt8, offset_of!(ExtentHeader, pair)),
        field("sc_orient", FieldType::UInt8, offset_of!(ExtentHeader, sc_orient)),
        field("valid", FieldType::UInt8, offset_of!(ExtentHeader, valid)),
        field("count", FieldType::UInt32, offset_of!(ExtentHeader, photon_count)),
        FieldDef {
            name: "photons",
            ftype: FieldType::User,
            offset: size_of::<ExtentHeader>(),
            count: 0,
            subtype: Some(PHOTON_REC_TYPE),
            flags: FIELD_FLAG_BATCH,
        },
    ];
    RecordSchema {
        rec_type: EXTENT_REC_TYPE,
        fixed_size: size_of::<ExtentHeader>(),
        fields,
    }
}

fn anc_element_schema() -> RecordSchema {
    let fields = vec![
        field("extent_id", FieldType::UInt64, offset_of!(AncElementHeader, extent_id)),
        field("num_elements", FieldType::UInt32, offset_of!(AncElementHeader, num_elements)),
        field("anc_type", FieldType::UInt8, offset_of!(AncElementHeader, anc_type)),
        field("field_index", FieldType::UInt8, offset_of!(AncElementHeader, field_index)),
        field("datatype", FieldType::UInt8, offset_of!(AncElementHeader, data_type)),
        FieldDef {
            name: "data",
            ftype: FieldType::UInt8,
            offset: size_of::<AncElementHeader>(),
            count: 0,
            subtype: None,
            flags: FIELD_FLAG_NONE,
        },
    ];
    RecordSchema {
        rec_type: ANC_ELEMENT_REC_TYPE,
        fixed_size: size_of::<AncElementHeader>(),
        fields,
    }
}

fn exception_schema() -> RecordSchema {
    let fields = vec![
        field("code", FieldType::Int32, offset_of!(ExceptionHeader, code)),
        field("level", FieldType::UInt8, offset_of!(ExceptionHeader, level)),
        FieldDef {
            name: "text",
            ftype: FieldType::UInt8,
            offset: size_of::<ExceptionHeader>(),
            count: 0,
            subtype: None,
            flags: FIELD_FLAG_NONE,
        },
    ];
    RecordSchema {
        rec_type: EXCEPTION_REC_TYPE,
        fixed_size: size_of::<ExceptionHeader>(),
        fields,
    }
}

fn container_schema() -> RecordSchema {
    let fields = vec![
        field("num_records", FieldType::UInt32, 0),
        FieldDef {
            name: "records",
            ftype: FieldType::User,
            offset: size_of::<u32>(),
            count: 0,
            subtype: None,
            flags: FIELD_FLAG_BATCH,
        },
    ];
    RecordSchema {
        rec_type: CONTAINER_REC_TYPE,
        fixed_size: size_of::<u32>(),
        fields,
    }
}

fn field(name: &'static str, ftype: FieldType, offset: usize) -> FieldDef {
    FieldDef {
        name,
        ftype,
        offset,
        count: 1,
        subtype: None,
        flags: FIELD_FLAG_NONE,
    }
}

/// A record ready to be framed and posted.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub rec_type: &'static str,
    pub payload: Bytes,
}

impl Record {
    pub fn new(rec_type: &'static str, payload: Bytes) -> Self {
        Record { rec_type, payload }
    }

    /// Total framed size in bytes.
    pub fn framed_len(&self) -> usize {
        size_of::<u16>() + self.rec_type.len() + self.payload.len()
    }

    /// Assemble the frame: u16 type-name length, type name, payload.
    pub fn frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.framed_len());
        buf.put_u16_le(self.rec_type.len() as u16);
        buf.put_slice(self.rec_type.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Split a frame back into type name and payload.
    pub fn parse(frame: &[u8]) -> Option<(String, Bytes)> {
        let name_len = u16::from_le_bytes(frame.get(0..2)?.try_into().ok()?) as usize;
        let name = std::str::from_utf8(frame.get(2..2 + name_len)?).ok()?;
        Some((
            name.to_string(),
            Bytes::copy_from_slice(&frame[2 + name_len..]),
        ))
    }
}

/// Build an extent record from its header and photon batch.
pub fn extent_record(header: &ExtentHeader, photons: &[PhotonRecord]) -> Record {
    let mut payload =
        BytesMut::with_capacity(size_of::<ExtentHeader>() + photons.len() * size_of::<PhotonRecord>());
    payload.put_slice(header.as_bytes());
    payload.put_slice(photons.as_bytes());
    Record::new(EXTENT_REC_TYPE, payload.freeze())
}

/// Build an exception record for an error condition.
pub fn exception_record(code: i32, severity: Severity, text: &str) -> Record {
    let header = ExceptionHeader {
        code,
        level: severity.level(),
    };
    let mut payload = BytesMut::with_capacity(size_of::<ExceptionHeader>() + text.len());
    payload.put_slice(header.as_bytes());
    payload.put_slice(text.as_bytes());
    Record::new(EXCEPTION_REC_TYPE, payload.freeze())
}

/// Wrap multiple records belonging to one extent into a container record.
pub fn container_record(records: &[Record]) -> Record {
    let total: usize = records.iter().map(|r| size_of::<u32>() + r.framed_len()).sum();
    let mut payload = BytesMut::with_capacity(size_of::<u32>() + total);
    payload.put_u32_le(records.len() as u32);
    for record in records {
        let frame = record.frame();
        payload.put_u32_le(frame.len() as u32);
        payload.put_slice(&frame);
    }
    Record::new(CONTAINER_REC_TYPE, payload.freeze())
}

/// Split a container payload back into the framed records it carries.
pub fn split_container(payload: &[u8]) -> Option<Vec<Bytes>> {
    let num = u32::from_le_bytes(payload.get(0..4)?.try_into().ok()?) as usize;
    let mut records = Vec::with_capacity(num);
    let mut at = 4;
    for _ in 0..num {
        let len = u32::from_le_bytes(payload.get(at..at + 4)?.try_into().ok()?) as usize;
        at += 4;
        records.push(Bytes::copy_from_slice(payload.get(at..at + len)?));
        at += len;
    }
    Some(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_photon() -> PhotonRecord {
        PhotonRecord {
            time_ns: 1_546_300_800_000_000_000,
            latitude: 71.5,
            longitude: -52.25,
            x_atc: -5.0,
            y_atc: 2.5,
            height: 102.75,
            relief: 0.0,
            landcover: crate::models::INVALID_FLAG,
            snowcover: crate::models::INVALID_FLAG,
            atl08_class: crate::models::ATL08_UNCLASSIFIED,
            atl03_cnf: 4,
            quality_ph: 0,
            yapc_score: 0,
        }
    }

    #[test]
    fn photon_record_is_packed() {
        assert_eq!(46, size_of::<PhotonRecord>());
        let schema = schema(PHOTON_REC_TYPE).unwrap();
        assert_eq!(46, schema.fixed_size);
        assert_eq!(13, schema.fields.len());
    }

    #[test]
    fn extent_header_is_packed() {
        assert_eq!(56, size_of::<ExtentHeader>());
    }

    #[test]
    fn extent_schema_has_batch_field() {
        let schema = schema(EXTENT_REC_TYPE).unwrap();
        let photons = schema.fields.last().unwrap();
        assert_eq!("photons", photons.name);
        assert_eq!(0, photons.count);
        assert_eq!(Some(PHOTON_REC_TYPE), photons.subtype);
        assert_eq!(FIELD_FLAG_BATCH, photons.flags & FIELD_FLAG_BATCH);
        assert_eq!(schema.fixed_size, photons.offset);
    }

    #[test]
    fn unknown_type_not_registered() {
        assert!(schema("atl99rec").is_none());
    }

    #[test]
    fn frame_round_trip() {
        let record = Record::new(EXTENT_REC_TYPE, Bytes::from_static(&[1, 2, 3]));
        let frame = record.frame();
        let (name, payload) = Record::parse(&frame).unwrap();
        assert_eq!(EXTENT_REC_TYPE, name);
        assert_eq!(Bytes::from_static(&[1, 2, 3]), payload);
    }

    #[test]
    fn extent_record_round_trip() {
        let header = ExtentHeader {
            extent_id: 42,
            rgt: 1047,
            cycle: 6,
            segment_id: 555000,
            segment_distance: 1.25e7,
            extent_length: 40.0,
            background_rate: 112.5,
            solar_elevation: -8.0,
            spacecraft_velocity: 7100.0,
            track: 2,
            pair: 1,
            sc_orient: 1,
            valid: 1,
            photon_count: 2,
        };
        let photons = [test_photon(), test_photon()];
        let record = extent_record(&header, &photons);
        assert_eq!(
            size_of::<ExtentHeader>() + 2 * size_of::<PhotonRecord>(),
            record.payload.len()
        );
        let decoded = ExtentHeader::read_from_prefix(&record.payload).unwrap();
        assert_eq!(header, decoded);
        let first =
            PhotonRecord::read_from_prefix(&record.payload[size_of::<ExtentHeader>()..]).unwrap();
        assert_eq!(photons[0], first);
    }

    #[test]
    fn exception_record_layout() {
        let record = exception_record(-4, Severity::Debug, "empty spatial region");
        let header = ExceptionHeader::read_from_prefix(&record.payload).unwrap();
        assert_eq!(-4, { header.code });
        assert_eq!(0, header.level);
        assert_eq!(
            b"empty spatial region",
            &record.payload[size_of::<ExceptionHeader>()..]
        );
    }

    #[test]
    fn container_round_trip() {
        let a = Record::new(EXTENT_REC_TYPE, Bytes::from_static(&[9]));
        let b = Record::new(ANC_ELEMENT_REC_TYPE, Bytes::from_static(&[8, 7]));
        let container = container_record(&[a.clone(), b.clone()]);
        let frames = split_container(&container.payload).unwrap();
        assert_eq!(2, frames.len());
        assert_eq!(a.frame(), frames[0]);
        assert_eq!(b.frame(), frames[1]);
    }
}
