//! ISO BMFF helpers for content protection: `pssh` boxes, `tenc` key ids and
//! PlayReady WRM headers.

use nom::bytes::complete::{tag, take};
use nom::multi::count;
use nom::number::complete::{be_u32, be_u8};
use nom::IResult;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::uri::base64_decode;

pub const WIDEVINE_SYSTEM_ID: [u8; 16] = [
    0xed, 0xef, 0x8b, 0xa9, 0x79, 0xd6, 0x4a, 0xce, 0xa3, 0xc8, 0x27, 0xdc, 0xd5, 0x1d, 0x21, 0xed,
];

pub const PLAYREADY_SYSTEM_ID: [u8; 16] = [
    0x9a, 0x04, 0xf0, 0x79, 0x98, 0x40, 0x42, 0x86, 0xab, 0x92, 0xe6, 0x5b, 0xe0, 0x88, 0x5f, 0x95,
];

/// Contents of a `pssh` box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsshInfo {
    pub version: u8,
    pub system_id: Vec<u8>,
    pub kids: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

fn pssh_box(i: &[u8]) -> IResult<&[u8], PsshInfo> {
    let (i, _size) = be_u32(i)?;
    let (i, _) = tag(&b"pssh"[..])(i)?;
    let (i, version) = be_u8(i)?;
    let (i, _flags) = take(3usize)(i)?;
    let (i, system_id) = take(16usize)(i)?;
    let (i, kids) = if version > 0 {
        let (i, kid_count) = be_u32(i)?;
        count(take(16usize), kid_count as usize)(i)?
    } else {
        (i, Vec::new())
    };
    let (i, data_size) = be_u32(i)?;
    let (i, data) = take(data_size as usize)(i)?;
    Ok((
        i,
        PsshInfo {
            version,
            system_id: system_id.to_vec(),
            kids: kids.into_iter().map(|k: &[u8]| k.to_vec()).collect(),
            data: data.to_vec(),
        },
    ))
}

/// Parses a single `pssh` box starting at the beginning of `data`.
pub fn parse_pssh(data: &[u8]) -> Option<PsshInfo> {
    pssh_box(data).ok().map(|(_, info)| info)
}

/// Parses every `pssh` box of a concatenation of top level boxes.
pub fn parse_multi_pssh(data: &[u8]) -> Vec<PsshInfo> {
    let mut results = Vec::new();
    let mut offset = 0;
    while offset + 8 <= data.len() {
        let size = read_u32(data, offset) as usize;
        if size < 8 || offset + size > data.len() {
            break;
        }
        if let Some(info) = parse_pssh(&data[offset..offset + size]) {
            results.push(info);
        }
        offset += size;
    }
    results
}

/// Builds a `pssh` box. Key ids make it a version 1 box.
pub fn mp4_pssh(system_id: &[u8; 16], kids: Option<&[Vec<u8>]>, data: &[u8]) -> Vec<u8> {
    let kid_bytes: usize = kids.map(|k| 4 + k.len() * 16).unwrap_or(0);
    let size = 8 + 4 + 16 + kid_bytes + 4 + data.len();
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(size as u32).to_be_bytes());
    out.extend_from_slice(b"pssh");
    out.push(if kids.is_some() { 1 } else { 0 });
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(system_id);
    if let Some(kids) = kids {
        out.extend_from_slice(&(kids.len() as u32).to_be_bytes());
        for kid in kids {
            let mut padded = [0u8; 16];
            let n = kid.len().min(16);
            padded[..n].copy_from_slice(&kid[..n]);
            out.extend_from_slice(&padded);
        }
    }
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_be_bytes(buf)
}

/// Payloads of every box matching `path`, descending one level per element.
///
/// A box size of 0 or 1 extends to the end of the enclosing data.
pub fn find_box<'a>(data: &'a [u8], path: &[&str]) -> Vec<&'a [u8]> {
    let mut results = Vec::new();
    let Some((head, tail)) = path.split_first() else {
        return results;
    };
    let end = data.len();
    let mut i = 0;
    while i + 8 <= end {
        let size = read_u32(data, i) as usize;
        let box_type = &data[i + 4..i + 8];
        let end_box = if size > 1 { (i + size).min(end) } else { end };
        if end_box < i + 8 {
            break;
        }
        if box_type == head.as_bytes() {
            let payload = &data[i + 8..end_box];
            if tail.is_empty() {
                results.push(payload);
            } else {
                results.extend(find_box(payload, tail));
            }
        }
        i = end_box;
    }
    results
}

fn sinf_tenc(sinf: &[u8]) -> Option<&[u8]> {
    let schm = find_box(sinf, &["schm"]).into_iter().next()?;
    let scheme = schm.get(4..8)?;
    if scheme != b"cbcs" && scheme != b"cenc" {
        return None;
    }
    find_box(sinf, &["schi", "tenc"]).into_iter().next()
}

/// Default key ids signalled in the `tenc` boxes of an init segment.
pub fn parse_key_ids_from_tenc(init_segment: &[u8]) -> Vec<Vec<u8>> {
    let mut key_ids: Vec<Vec<u8>> = Vec::new();
    for trak in find_box(init_segment, &["moov", "trak"]) {
        let Some(stsd) = find_box(trak, &["mdia", "minf", "stbl", "stsd"])
            .into_iter()
            .next()
        else {
            continue;
        };
        let Some(entries) = stsd.get(8..) else {
            continue;
        };
        let mut enc_boxes = find_box(entries, &["enca"]);
        let is_audio = !enc_boxes.is_empty();
        if !is_audio {
            enc_boxes = find_box(entries, &["encv"]);
        }
        for enc in enc_boxes {
            let Some(children) = enc.get(if is_audio { 28 } else { 78 }..) else {
                continue;
            };
            for sinf in find_box(children, &["sinf"]) {
                let Some(kid) = sinf_tenc(sinf).and_then(|tenc| tenc.get(8..24)) else {
                    continue;
                };
                if !key_ids.iter().any(|k| k.as_slice() == kid) {
                    key_ids.push(kid.to_vec());
                }
            }
        }
    }
    key_ids
}

/// Extracts the key id of a UTF-16LE PlayReady WRM header.
///
/// The GUID stored in the header is little endian; the returned key id is in
/// big endian byte order.
pub fn parse_play_ready_wrm(key_bytes: &[u8]) -> Option<Vec<u8>> {
    let units: Vec<u16> = key_bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let text = String::from_utf16_lossy(&units);
    let xml = &text[text.find('<')?..];

    let encoded = wrm_kid(xml)?;
    let mut key_id = base64_decode(&encoded)?;
    key_id.truncate(16);
    if key_id.len() < 8 {
        return None;
    }
    change_endianness(&mut key_id);
    Some(key_id)
}

fn wrm_kid(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut in_kid = false;
    let mut attr_value = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"KID" => {
                in_kid = true;
                attr_value = kid_value_attr(&e);
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"KID" => {
                return kid_value_attr(&e);
            }
            Ok(Event::Text(t)) if in_kid => {
                let value = t.unescape().ok()?.trim().to_string();
                if !value.is_empty() {
                    return Some(value);
                }
            }
            Ok(Event::End(e)) if in_kid && e.local_name().as_ref() == b"KID" => {
                return attr_value;
            }
            Ok(Event::Eof) | Err(_) => return attr_value,
            _ => {}
        }
    }
}

fn kid_value_attr(e: &quick_xml::events::BytesStart) -> Option<String> {
    e.try_get_attribute("VALUE")
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn change_endianness(key_id: &mut [u8]) {
    key_id.swap(0, 3);
    key_id.swap(1, 2);
    key_id.swap(4, 5);
    key_id.swap(6, 7);
}
