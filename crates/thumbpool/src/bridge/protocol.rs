//! Wire types for scheduler-worker rounds.
//!
//! One round is a fixed sequence:
//! - **Parameter record** (scheduler → worker): fixed-size header, then filename bytes
//! - **Result code** (worker → scheduler)
//! - **Payload length + payload** (worker → scheduler, only when the code is OK)
//!
//! Both processes come from the same build, so integers travel as fixed-width
//! native-endian values.

use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Byte length of the parameter header that precedes the filename.
pub const PARAM_HEADER_LEN: usize = 8 + 8 + 11 * 4 + 6 * 4;

pub const RESULT_CODE_LEN: usize = size_of::<i64>();

pub const PAYLOAD_LEN_LEN: usize = size_of::<u64>();

/// Upper bound on filename bytes accepted on either end.
pub const MAX_FILENAME_LEN: usize = 4096;

/// Tiling layout: several frames composed into one panel. Zero means unspecified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileSpec {
    /// Seconds between sampled frames.
    pub sample_interval: u32,
    pub rows: u32,
    pub cols: u32,
    pub max_rows: u32,
    pub max_cols: u32,
    pub margin: u32,
    pub padding: u32,
    /// Background as 0xRRGGBB.
    pub color: u32,
}

impl TileSpec {
    pub fn is_tiled(&self) -> bool {
        self.rows > 1 || self.cols > 1
    }
}

/// JPEG encoder knobs handed through to the extractor untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeOptions {
    pub quality: u32,
    pub baseline: bool,
    pub progressive: bool,
    pub optimize: u32,
    pub smooth: u32,
    pub dpi: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            quality: 75,
            baseline: true,
            progressive: false,
            optimize: 100,
            smooth: 0,
            dpi: 72,
        }
    }
}

/// Everything a worker needs to produce one thumbnail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractParams {
    pub filename: PathBuf,
    pub second: i64,
    /// 0 keeps the source width (or derives it from height).
    #[serde(default)]
    pub width: u32,
    /// 0 keeps the source height.
    #[serde(default)]
    pub height: u32,
    /// Seek to the nearest keyframe instead of decoding up to the exact frame.
    #[serde(default)]
    pub only_keyframe: bool,
    #[serde(default)]
    pub tile: TileSpec,
    #[serde(default)]
    pub encode: EncodeOptions,
}

impl ExtractParams {
    pub fn new(filename: impl Into<PathBuf>, second: i64) -> Self {
        Self {
            filename: filename.into(),
            second,
            width: 0,
            height: 0,
            only_keyframe: false,
            tile: TileSpec::default(),
            encode: EncodeOptions::default(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_tile(mut self, tile: TileSpec) -> Self {
        self.tile = tile;
        self
    }

    pub fn with_encode(mut self, encode: EncodeOptions) -> Self {
        self.encode = encode;
        self
    }

    pub fn with_only_keyframe(mut self, only_keyframe: bool) -> Self {
        self.only_keyframe = only_keyframe;
        self
    }

    pub fn filename_bytes(&self) -> &[u8] {
        self.filename.as_os_str().as_bytes()
    }

    /// Encode the fixed-size header. The filename bytes follow as their own step.
    pub fn encode_header(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PARAM_HEADER_LEN);
        buf.put_u64_ne(self.filename_bytes().len() as u64);
        buf.put_i64_ne(self.second);
        buf.put_u32_ne(self.width);
        buf.put_u32_ne(self.height);
        buf.put_u32_ne(u32::from(self.only_keyframe));
        buf.put_u32_ne(self.tile.sample_interval);
        buf.put_u32_ne(self.tile.rows);
        buf.put_u32_ne(self.tile.cols);
        buf.put_u32_ne(self.tile.max_rows);
        buf.put_u32_ne(self.tile.max_cols);
        buf.put_u32_ne(self.tile.margin);
        buf.put_u32_ne(self.tile.padding);
        buf.put_u32_ne(self.tile.color);
        buf.put_u32_ne(self.encode.quality);
        buf.put_u32_ne(u32::from(self.encode.baseline));
        buf.put_u32_ne(u32::from(self.encode.progressive));
        buf.put_u32_ne(self.encode.optimize);
        buf.put_u32_ne(self.encode.smooth);
        buf.put_u32_ne(self.encode.dpi);
        debug_assert_eq!(buf.len(), PARAM_HEADER_LEN);
        buf
    }
}

/// Decoded parameter header, waiting for its filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamHeader {
    pub filename_len: u64,
    params: ExtractParams,
}

impl ParamHeader {
    /// Decode a complete header. `bytes` must be exactly [`PARAM_HEADER_LEN`] long.
    pub fn decode(mut bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PARAM_HEADER_LEN {
            return None;
        }
        let filename_len = bytes.get_u64_ne();
        let second = bytes.get_i64_ne();
        let width = bytes.get_u32_ne();
        let height = bytes.get_u32_ne();
        let only_keyframe = bytes.get_u32_ne() != 0;
        let tile = TileSpec {
            sample_interval: bytes.get_u32_ne(),
            rows: bytes.get_u32_ne(),
            cols: bytes.get_u32_ne(),
            max_rows: bytes.get_u32_ne(),
            max_cols: bytes.get_u32_ne(),
            margin: bytes.get_u32_ne(),
            padding: bytes.get_u32_ne(),
            color: bytes.get_u32_ne(),
        };
        let encode = EncodeOptions {
            quality: bytes.get_u32_ne(),
            baseline: bytes.get_u32_ne() != 0,
            progressive: bytes.get_u32_ne() != 0,
            optimize: bytes.get_u32_ne(),
            smooth: bytes.get_u32_ne(),
            dpi: bytes.get_u32_ne(),
        };

        Some(Self {
            filename_len,
            params: ExtractParams {
                filename: PathBuf::new(),
                second,
                width,
                height,
                only_keyframe,
                tile,
                encode,
            },
        })
    }

    pub fn with_filename(mut self, filename: Vec<u8>) -> ExtractParams {
        self.params.filename = PathBuf::from(std::ffi::OsString::from_vec(filename));
        self.params
    }
}

/// Result code sent by the worker at the start of its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    FileNotFound,
    TimeNotFound,
    /// Any negative wire value.
    GenericError(i64),
}

impl ResultCode {
    pub const GENERIC: ResultCode = ResultCode::GenericError(-1);

    pub fn to_wire(self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::FileNotFound => 1,
            Self::TimeNotFound => 2,
            Self::GenericError(code) if code < 0 => code,
            Self::GenericError(_) => -1,
        }
    }

    /// Positive codes other than 1 and 2 are framing errors, not results.
    pub fn from_wire(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::TimeNotFound),
            c if c < 0 => Some(Self::GenericError(c)),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_length_matches_encoding() {
        let params = ExtractParams::new("/videos/a.mp4", 12);
        assert_eq!(params.encode_header().len(), PARAM_HEADER_LEN);
        assert_eq!(PARAM_HEADER_LEN, 84);
    }

    #[test]
    fn header_decodes_every_field() {
        let params = ExtractParams::new("/videos/clip.mp4", 42)
            .with_size(320, 0)
            .with_only_keyframe(true)
            .with_tile(TileSpec {
                sample_interval: 2,
                rows: 4,
                cols: 4,
                max_rows: 0,
                max_cols: 5,
                margin: 5,
                padding: 3,
                color: 0xEEAA33,
            })
            .with_encode(EncodeOptions {
                quality: 90,
                baseline: false,
                progressive: true,
                optimize: 50,
                smooth: 10,
                dpi: 300,
            });

        let header = ParamHeader::decode(&params.encode_header()).unwrap();
        assert_eq!(header.filename_len, "/videos/clip.mp4".len() as u64);

        let decoded = header.with_filename(b"/videos/clip.mp4".to_vec());
        assert_eq!(decoded, params);
    }

    #[test]
    fn header_rejects_wrong_length() {
        assert!(ParamHeader::decode(&[0u8; PARAM_HEADER_LEN - 1]).is_none());
        assert!(ParamHeader::decode(&[0u8; PARAM_HEADER_LEN + 1]).is_none());
    }

    #[test]
    fn result_codes_map_to_wire() {
        assert_eq!(ResultCode::Ok.to_wire(), 0);
        assert_eq!(ResultCode::FileNotFound.to_wire(), 1);
        assert_eq!(ResultCode::TimeNotFound.to_wire(), 2);
        assert_eq!(ResultCode::GENERIC.to_wire(), -1);
        assert_eq!(ResultCode::GenericError(-17).to_wire(), -17);
        // A non-negative generic code would alias a real result.
        assert_eq!(ResultCode::GenericError(5).to_wire(), -1);
    }

    #[test]
    fn unknown_positive_code_is_not_a_result() {
        assert_eq!(ResultCode::from_wire(0), Some(ResultCode::Ok));
        assert_eq!(ResultCode::from_wire(-3), Some(ResultCode::GenericError(-3)));
        assert_eq!(ResultCode::from_wire(3), None);
        assert_eq!(ResultCode::from_wire(i64::MAX), None);
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let params: ExtractParams =
            serde_json::from_str(r#"{"filename": "/v/a.mp4", "second": 7, "height": 64}"#)
                .unwrap();
        assert_eq!(params.second, 7);
        assert_eq!(params.width, 0);
        assert_eq!(params.height, 64);
        assert!(!params.tile.is_tiled());
        assert_eq!(params.encode, EncodeOptions::default());
    }
}
