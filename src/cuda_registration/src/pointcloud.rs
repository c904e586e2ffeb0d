//! Point cloud file loading.
//!
//! Supported inputs:
//! - PLY, `ascii` or `binary_little_endian`, reading the `x`, `y`, `z`
//!   properties of the `vertex` element (any scalar type).
//! - Plain text (`.xyz`, `.txt`, `.pts`): one point per line, first three
//!   whitespace-separated numbers, `#` comments allowed.
//!
//! Points with a non-finite coordinate are dropped on load.

use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use tracing::{debug, warn};

/// Load a point cloud, dispatching on the file extension.
pub fn load_points(path: &Path) -> Result<Vec<[f32; 3]>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let raw = match extension.as_str() {
        "ply" => parse_ply(&bytes),
        _ => {
            let text = std::str::from_utf8(&bytes).context("point file is not valid UTF-8")?;
            parse_xyz(text)
        }
    }
    .with_context(|| format!("failed to parse {}", path.display()))?;

    let total = raw.len();
    let points = drop_non_finite(raw);
    if points.len() < total {
        warn!(
            path = %path.display(),
            removed = total - points.len(),
            "Dropped points with non-finite coordinates"
        );
    }
    debug!(path = %path.display(), num_points = points.len(), "Loaded point cloud");
    Ok(points)
}

/// Remove points with NaN or infinite coordinates.
pub fn drop_non_finite(points: Vec<[f32; 3]>) -> Vec<[f32; 3]> {
    points
        .into_iter()
        .filter(|p| p.iter().all(|c| c.is_finite()))
        .collect()
}

/// Parse whitespace-separated `x y z` lines.
pub fn parse_xyz(text: &str) -> Result<Vec<[f32; 3]>> {
    let mut points = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let coords = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .take(3)
            .map(str::parse::<f32>)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("line {}: invalid number", line_no + 1))?;
        ensure!(
            coords.len() == 3,
            "line {}: expected 3 coordinates, found {}",
            line_no + 1,
            coords.len()
        );
        points.push([coords[0], coords[1], coords[2]]);
    }
    Ok(points)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlyFormat {
    Ascii,
    BinaryLittleEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl ScalarType {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "char" | "int8" => ScalarType::I8,
            "uchar" | "uint8" => ScalarType::U8,
            "short" | "int16" => ScalarType::I16,
            "ushort" | "uint16" => ScalarType::U16,
            "int" | "int32" => ScalarType::I32,
            "uint" | "uint32" => ScalarType::U32,
            "float" | "float32" => ScalarType::F32,
            "double" | "float64" => ScalarType::F64,
            other => bail!("unsupported PLY scalar type '{other}'"),
        })
    }

    fn size(self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }

    /// Decode one little-endian value; `bytes` holds exactly `size()` bytes.
    fn read_le(self, bytes: &[u8]) -> f64 {
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        match self {
            ScalarType::I8 => buf[0] as i8 as f64,
            ScalarType::U8 => buf[0] as f64,
            ScalarType::I16 => i16::from_le_bytes([buf[0], buf[1]]) as f64,
            ScalarType::U16 => u16::from_le_bytes([buf[0], buf[1]]) as f64,
            ScalarType::I32 => i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            ScalarType::U32 => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            ScalarType::F32 => f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            ScalarType::F64 => f64::from_le_bytes(buf),
        }
    }
}

#[derive(Debug)]
struct PlyElement {
    name: String,
    count: usize,
    /// `(name, type)`; `None` type marks a list property.
    properties: Vec<(String, Option<ScalarType>)>,
}

impl PlyElement {
    fn row_size(&self) -> Option<usize> {
        self.properties
            .iter()
            .map(|(_, ty)| ty.map(ScalarType::size))
            .sum()
    }

    fn index_of(&self, name: &str) -> Result<(usize, ScalarType)> {
        let index = self
            .properties
            .iter()
            .position(|(n, _)| n == name)
            .with_context(|| format!("vertex element has no '{name}' property"))?;
        match self.properties[index].1 {
            Some(ty) => Ok((index, ty)),
            None => bail!("vertex property '{name}' is a list"),
        }
    }
}

struct PlyHeader {
    format: PlyFormat,
    elements: Vec<PlyElement>,
    body_offset: usize,
}

fn parse_ply_header(bytes: &[u8]) -> Result<PlyHeader> {
    const END: &[u8] = b"end_header";
    let end = bytes
        .windows(END.len())
        .position(|w| w == END)
        .context("missing end_header")?;
    let mut body_offset = end + END.len();
    if bytes.get(body_offset) == Some(&b'\r') {
        body_offset += 1;
    }
    ensure!(bytes.get(body_offset) == Some(&b'\n'), "malformed end_header line");
    body_offset += 1;

    let header = std::str::from_utf8(&bytes[..end]).context("PLY header is not valid UTF-8")?;
    let mut lines = header.lines().map(str::trim);
    ensure!(lines.next() == Some("ply"), "not a PLY file");

    let mut format = None;
    let mut elements: Vec<PlyElement> = Vec::new();
    for line in lines {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["format", "ascii", ..] => format = Some(PlyFormat::Ascii),
            ["format", "binary_little_endian", ..] => format = Some(PlyFormat::BinaryLittleEndian),
            ["format", other, ..] => bail!("unsupported PLY format '{other}'"),
            ["element", name, count] => elements.push(PlyElement {
                name: name.to_string(),
                count: count.parse().context("invalid element count")?,
                properties: Vec::new(),
            }),
            ["property", "list", _, _, name] => elements
                .last_mut()
                .context("property before element")?
                .properties
                .push((name.to_string(), None)),
            ["property", ty, name] => elements
                .last_mut()
                .context("property before element")?
                .properties
                .push((name.to_string(), Some(ScalarType::parse(ty)?))),
            ["comment", ..] | ["obj_info", ..] | [] => {}
            _ => bail!("unrecognized PLY header line '{line}'"),
        }
    }

    Ok(PlyHeader {
        format: format.context("missing format line")?,
        elements,
        body_offset,
    })
}

/// Parse the vertex positions of a PLY file.
pub fn parse_ply(bytes: &[u8]) -> Result<Vec<[f32; 3]>> {
    let header = parse_ply_header(bytes)?;
    let vertex_index = header
        .elements
        .iter()
        .position(|e| e.name == "vertex")
        .context("PLY file has no vertex element")?;
    let vertex = &header.elements[vertex_index];
    let axes = [vertex.index_of("x")?, vertex.index_of("y")?, vertex.index_of("z")?];
    let body = &bytes[header.body_offset..];

    match header.format {
        PlyFormat::Ascii => {
            let text = std::str::from_utf8(body).context("PLY body is not valid UTF-8")?;
            let skip: usize = header.elements[..vertex_index].iter().map(|e| e.count).sum();
            let mut lines = text.lines().filter(|l| !l.trim().is_empty()).skip(skip);
            let mut points = Vec::with_capacity(vertex.count);
            for i in 0..vertex.count {
                let line = lines
                    .next()
                    .with_context(|| format!("expected {} vertices, found {i}", vertex.count))?;
                let values: Vec<&str> = line.split_whitespace().collect();
                let mut p = [0.0f32; 3];
                for (slot, (index, _)) in p.iter_mut().zip(axes) {
                    *slot = values
                        .get(index)
                        .with_context(|| format!("vertex {i}: missing value"))?
                        .parse::<f32>()
                        .with_context(|| format!("vertex {i}: invalid number"))?;
                }
                points.push(p);
            }
            Ok(points)
        }
        PlyFormat::BinaryLittleEndian => {
            let mut offset = 0usize;
            for element in &header.elements[..vertex_index] {
                let row = element
                    .row_size()
                    .with_context(|| format!("cannot skip list element '{}'", element.name))?;
                offset += row * element.count;
            }
            let row = vertex.row_size().context("vertex element has list properties")?;

            // byte offset of each property within a vertex row
            let mut starts = Vec::with_capacity(vertex.properties.len());
            let mut acc = 0usize;
            for (_, ty) in &vertex.properties {
                starts.push(acc);
                acc += ty.map(ScalarType::size).unwrap_or(0);
            }

            let needed = offset + row * vertex.count;
            ensure!(
                body.len() >= needed,
                "PLY body too short: {} bytes, need {needed}",
                body.len()
            );

            let points = body[offset..needed]
                .chunks_exact(row)
                .map(|r| {
                    let mut p = [0.0f32; 3];
                    for (slot, (index, ty)) in p.iter_mut().zip(axes) {
                        let start = starts[index];
                        *slot = ty.read_le(&r[start..start + ty.size()]) as f32;
                    }
                    p
                })
                .collect();
            Ok(points)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_xyz_with_comments() {
        let text = "# header\n1 2 3\n\n4.5 5.5 6.5 extra\n-1,0,1\n";
        let points = parse_xyz(text).unwrap();
        assert_eq!(points, vec![[1.0, 2.0, 3.0], [4.5, 5.5, 6.5], [-1.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_parse_xyz_short_line_fails() {
        assert!(parse_xyz("1 2\n").is_err());
        assert!(parse_xyz("1 2 abc\n").is_err());
    }

    #[test]
    fn test_parse_ascii_ply() {
        let ply = b"ply\nformat ascii 1.0\ncomment test\nelement vertex 2\n\
property float x\nproperty float y\nproperty float z\nproperty uchar red\n\
element face 0\nproperty list uchar int vertex_indices\nend_header\n\
0 1 2 255\n3 4 5 0\n";
        let points = parse_ply(ply).unwrap();
        assert_eq!(points, vec![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]]);
    }

    #[test]
    fn test_parse_binary_ply_float_and_double() {
        let mut bytes = b"ply\nformat binary_little_endian 1.0\nelement vertex 2\n\
property double x\nproperty double y\nproperty double z\nproperty float intensity\nend_header\n"
            .to_vec();
        for (p, intensity) in [([1.0f64, 2.0, 3.0], 0.5f32), ([-4.0, 5.5, 0.25], 1.0)] {
            for c in p {
                bytes.extend_from_slice(&c.to_le_bytes());
            }
            bytes.extend_from_slice(&intensity.to_le_bytes());
        }
        let points = parse_ply(&bytes).unwrap();
        assert_eq!(points, vec![[1.0, 2.0, 3.0], [-4.0, 5.5, 0.25]]);

        let mut bytes = b"ply\r\nformat binary_little_endian 1.0\r\nelement vertex 1\r\n\
property float x\r\nproperty float y\r\nproperty float z\r\nend_header\r\n"
            .to_vec();
        for c in [7.0f32, 8.0, 9.0] {
            bytes.extend_from_slice(&c.to_le_bytes());
        }
        assert_eq!(parse_ply(&bytes).unwrap(), vec![[7.0, 8.0, 9.0]]);
    }

    #[test]
    fn test_binary_ply_truncated() {
        let mut bytes = b"ply\nformat binary_little_endian 1.0\nelement vertex 2\n\
property float x\nproperty float y\nproperty float z\nend_header\n"
            .to_vec();
        bytes.extend_from_slice(&[0u8; 12]);
        assert!(parse_ply(&bytes).is_err());
    }

    #[test]
    fn test_big_endian_rejected() {
        let bytes = b"ply\nformat binary_big_endian 1.0\nelement vertex 0\nend_header\n";
        assert!(parse_ply(bytes).is_err());
    }

    #[test]
    fn test_load_drops_non_finite() {
        let mut file = tempfile::Builder::new().suffix(".xyz").tempfile().unwrap();
        writeln!(file, "0 0 0\nnan 1 1\n1 inf 1\n2 2 2").unwrap();
        let points = load_points(file.path()).unwrap();
        assert_eq!(points, vec![[0.0, 0.0, 0.0], [2.0, 2.0, 2.0]]);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_points(&dir.path().join("nope.ply")).is_err());
    }
}
