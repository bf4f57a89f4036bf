use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::engine::Payload;
use crate::error::DecodeError;

/// The supported animation container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimationKind {
    Gif,
    Lottie,
    Svga,
    Pag,
    Vap,
}

impl AnimationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gif => "gif",
            Self::Lottie => "lottie",
            Self::Svga => "svga",
            Self::Pag => "pag",
            Self::Vap => "vap",
        }
    }

    /// Resolves a file extension to the format usually stored under it.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            "gif" => Self::Gif,
            "json" | "lottie" => Self::Lottie,
            "svga" => Self::Svga,
            "pag" => Self::Pag,
            "mp4" | "vap" => Self::Vap,
            _ => return None,
        })
    }
}

impl fmt::Display for AnimationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header of a GIF file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GifInfo {
    /// Either `87a` or `89a`.
    pub version: String,
    pub width: u16,
    pub height: u16,
}

/// The top level properties of a Lottie composition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LottieInfo {
    /// The bodymovin version that exported the composition.
    pub version: String,
    pub name: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub in_point: f64,
    pub out_point: f64,
}

/// The two SVGA container generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SvgaGeneration {
    /// SVGA 1.x: a zip archive with a JSON movie spec and image files.
    Zip,
    /// SVGA 2.x: a zlib compressed protobuf movie entity.
    Compressed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SvgaInfo {
    pub generation: SvgaGeneration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PagInfo {
    pub version: u8,
}

/// An MP4 with an optional `vapc` box describing the alpha overlay layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VapInfo {
    /// The major brand from the `ftyp` box.
    pub brand: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub frames: Option<u32>,
}

/// A decoded animation of any of the supported formats.
///
/// The payload keeps the raw source alongside the information parsed from its header.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Animation {
    Gif {
        info: GifInfo,
        #[serde(skip)]
        data: Bytes,
    },
    Lottie {
        info: LottieInfo,
        #[serde(skip)]
        data: Bytes,
    },
    Svga {
        info: SvgaInfo,
        #[serde(skip)]
        data: Bytes,
    },
    Pag {
        info: PagInfo,
        #[serde(skip)]
        data: Bytes,
    },
    Vap {
        info: VapInfo,
        #[serde(skip)]
        data: Bytes,
    },
}

const GIF87A: &[u8] = b"GIF87a";
const GIF89A: &[u8] = b"GIF89a";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const PAG_MAGIC: &[u8] = b"PAG";

impl Animation {
    /// Identifies the format of `data` and parses its header.
    pub fn probe(data: Bytes) -> Result<Self, DecodeError> {
        if data.starts_with(GIF87A) || data.starts_with(GIF89A) {
            return probe_gif(data);
        }
        if data.starts_with(ZIP_MAGIC) {
            let info = SvgaInfo {
                generation: SvgaGeneration::Zip,
            };
            return Ok(Self::Svga { info, data });
        }
        if is_zlib_header(&data) {
            let info = SvgaInfo {
                generation: SvgaGeneration::Compressed,
            };
            return Ok(Self::Svga { info, data });
        }
        if data.starts_with(PAG_MAGIC) {
            let version = *data
                .get(PAG_MAGIC.len())
                .ok_or_else(|| DecodeError::Malformed("truncated PAG header".into()))?;
            return Ok(Self::Pag {
                info: PagInfo { version },
                data,
            });
        }
        if data.get(4..8) == Some(&b"ftyp"[..]) {
            return probe_vap(data);
        }
        if data.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') {
            return probe_lottie(data);
        }

        Err(DecodeError::Unsupported(
            "unrecognized animation format".into(),
        ))
    }

    pub fn kind(&self) -> AnimationKind {
        match self {
            Self::Gif { .. } => AnimationKind::Gif,
            Self::Lottie { .. } => AnimationKind::Lottie,
            Self::Svga { .. } => AnimationKind::Svga,
            Self::Pag { .. } => AnimationKind::Pag,
            Self::Vap { .. } => AnimationKind::Vap,
        }
    }

    /// The raw source the animation was decoded from.
    pub fn data(&self) -> &Bytes {
        match self {
            Self::Gif { data, .. }
            | Self::Lottie { data, .. }
            | Self::Svga { data, .. }
            | Self::Pag { data, .. }
            | Self::Vap { data, .. } => data,
        }
    }

    /// The canvas size, for formats that declare it in their header.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            Self::Gif { info, .. } => Some((info.width.into(), info.height.into())),
            Self::Lottie { info, .. } => Some((info.width, info.height)),
            Self::Vap { info, .. } => info.width.zip(info.height),
            Self::Svga { .. } | Self::Pag { .. } => None,
        }
    }

    /// The play time of a single loop, for formats that declare it in their header.
    ///
    /// `None` if the header declares a play time that does not fit a [`Duration`].
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Lottie { info, .. } if info.frame_rate > 0.0 => {
                let frames = (info.out_point - info.in_point).max(0.0);
                Duration::try_from_secs_f64(frames / info.frame_rate).ok()
            }
            Self::Vap { info, .. } => match (info.frames, info.fps) {
                (Some(frames), Some(fps)) if fps > 0 => {
                    Some(Duration::from_secs_f64(f64::from(frames) / f64::from(fps)))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

impl Payload for Animation {
    fn weight(&self) -> u32 {
        let size = std::mem::size_of::<Self>() + self.data().len();
        u32::try_from(size).unwrap_or(u32::MAX)
    }
}

fn probe_gif(data: Bytes) -> Result<Animation, DecodeError> {
    let screen = data
        .get(6..10)
        .ok_or_else(|| DecodeError::Malformed("truncated GIF header".into()))?;
    let info = GifInfo {
        version: String::from_utf8_lossy(&data[3..6]).into_owned(),
        width: u16::from_le_bytes([screen[0], screen[1]]),
        height: u16::from_le_bytes([screen[2], screen[3]]),
    };
    Ok(Animation::Gif { info, data })
}

/// `CMF` and `FLG` of a zlib stream: deflate with a 32K window, and a valid check sum.
fn is_zlib_header(data: &[u8]) -> bool {
    match data {
        [cmf @ 0x78, flg, ..] => (u16::from(*cmf) << 8 | u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

#[derive(Deserialize)]
struct RawLottie {
    v: String,
    nm: Option<String>,
    w: f64,
    h: f64,
    fr: f64,
    ip: f64,
    op: f64,
}

fn probe_lottie(data: Bytes) -> Result<Animation, DecodeError> {
    let raw: RawLottie = serde_json::from_slice(&data)
        .map_err(|e| DecodeError::Malformed(format!("invalid lottie composition: {e}")))?;
    let info = LottieInfo {
        version: raw.v,
        name: raw.nm,
        width: raw.w as u32,
        height: raw.h as u32,
        frame_rate: raw.fr,
        in_point: raw.ip,
        out_point: raw.op,
    };
    Ok(Animation::Lottie { info, data })
}

#[derive(Deserialize)]
struct RawVapConfig {
    info: RawVapInfo,
}

#[derive(Deserialize)]
struct RawVapInfo {
    w: Option<u32>,
    h: Option<u32>,
    fps: Option<u32>,
    f: Option<u32>,
}

fn probe_vap(data: Bytes) -> Result<Animation, DecodeError> {
    let brand = data
        .get(8..12)
        .ok_or_else(|| DecodeError::Malformed("truncated ftyp box".into()))?;
    let mut info = VapInfo {
        brand: String::from_utf8_lossy(brand).into_owned(),
        width: None,
        height: None,
        fps: None,
        frames: None,
    };

    if let Some(config) = find_vapc_box(&data) {
        match serde_json::from_slice::<RawVapConfig>(config) {
            Ok(RawVapConfig { info: raw }) => {
                info.width = raw.w;
                info.height = raw.h;
                info.fps = raw.fps;
                info.frames = raw.f;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unreadable vapc box");
            }
        }
    }

    Ok(Animation::Vap { info, data })
}

/// Walks the top level MP4 boxes looking for the `vapc` box, returning its payload.
fn find_vapc_box(data: &[u8]) -> Option<&[u8]> {
    let mut offset = 0usize;
    while let Some(header) = data.get(offset..offset + 8) {
        let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if size < 8 {
            return None;
        }
        if &header[4..8] == b"vapc" {
            return data.get(offset + 8..offset + size);
        }
        offset = offset.checked_add(size)?;
    }
    None
}
