// ============================================================
// Layer 4 — Slide Reader
// ============================================================
// PANDA slides are multi-page TIFF pyramids: page 0 is the full
// resolution scan, every following page is a 4x downsample of
// the previous one. Tiling usually happens on a reduced level,
// so the reader decodes one page on demand instead of the whole
// file.
//
// Plain raster files (PNG / JPEG) are accepted as single-level
// pyramids, which keeps tests and small experiments simple.
//
// Reference: tiff crate documentation

use anyhow::{bail, Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};
use tiff::{
    decoder::{Decoder, DecodingResult, Limits},
    ColorType,
};

/// Which pyramid page to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PyramidLevel {
    /// 0 = full resolution.
    Index(usize),
    /// The smallest page in the file.
    Lowest,
}

impl Default for PyramidLevel {
    fn default() -> Self {
        PyramidLevel::Lowest
    }
}

impl std::str::FromStr for PyramidLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lowest" | "-1" => Ok(PyramidLevel::Lowest),
            n => n
                .parse::<usize>()
                .map(PyramidLevel::Index)
                .map_err(|_| format!("expected a level index or 'lowest', got '{n}'")),
        }
    }
}

pub struct SlideReader {
    path: PathBuf,
    kind: SlideFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlideFormat {
    TiffPyramid,
    Raster,
}

impl SlideReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            bail!("Slide file '{}' does not exist", path.display());
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let kind = match ext.as_deref() {
            Some("tif") | Some("tiff") => SlideFormat::TiffPyramid,
            _ => SlideFormat::Raster,
        };
        Ok(Self { path, kind })
    }

    /// `<dir>/<image_id>.tiff`, the PANDA layout.
    pub fn open_in(dir: impl AsRef<Path>, image_id: &str) -> Result<Self> {
        Self::open(dir.as_ref().join(format!("{image_id}.tiff")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn level_count(&self) -> Result<usize> {
        match self.kind {
            SlideFormat::Raster => Ok(1),
            SlideFormat::TiffPyramid => {
                let mut decoder = self.decoder()?;
                let mut count = 1;
                while decoder.more_images() {
                    decoder.next_image()?;
                    count += 1;
                }
                Ok(count)
            }
        }
    }

    pub fn read_level(&self, level: PyramidLevel) -> Result<RgbImage> {
        match self.kind {
            SlideFormat::Raster => {
                if let PyramidLevel::Index(i) = level {
                    if i > 0 {
                        bail!("'{}' has a single level, asked for level {i}", self.path.display());
                    }
                }
                let img = image::open(&self.path)
                    .with_context(|| format!("Cannot decode '{}'", self.path.display()))?;
                Ok(img.to_rgb8())
            }
            SlideFormat::TiffPyramid => self.read_tiff_level(level),
        }
    }

    fn decoder(&self) -> Result<Decoder<BufReader<File>>> {
        let file = File::open(&self.path)
            .with_context(|| format!("Cannot open '{}'", self.path.display()))?;
        let decoder = Decoder::new(BufReader::new(file))
            .with_context(|| format!("'{}' is not a readable TIFF", self.path.display()))?
            .with_limits(Limits::unlimited());
        Ok(decoder)
    }

    fn read_tiff_level(&self, level: PyramidLevel) -> Result<RgbImage> {
        let mut decoder = self.decoder()?;
        let mut current = 0usize;
        let wanted = match level {
            PyramidLevel::Index(i) => Some(i),
            PyramidLevel::Lowest   => None,
        };

        loop {
            if Some(current) == wanted || (wanted.is_none() && !decoder.more_images()) {
                break;
            }
            if !decoder.more_images() {
                bail!(
                    "'{}' has {} levels, asked for level {:?}",
                    self.path.display(),
                    current + 1,
                    level
                );
            }
            decoder.next_image()?;
            current += 1;
        }

        let (width, height) = decoder.dimensions()?;
        let color = decoder.colortype()?;
        let data = match decoder.read_image()? {
            DecodingResult::U8(buf) => buf,
            _ => bail!("'{}' level {current}: only 8-bit samples are supported", self.path.display()),
        };
        tracing::debug!(
            "Decoded '{}' level {} ({}x{}, {:?})",
            self.path.display(), current, width, height, color
        );
        to_rgb(width, height, color, data)
            .with_context(|| format!("'{}' level {current}", self.path.display()))
    }
}

fn to_rgb(width: u32, height: u32, color: ColorType, data: Vec<u8>) -> Result<RgbImage> {
    let rgb = match color {
        // JPEG-compressed pages come back already converted to RGB.
        ColorType::RGB(8) | ColorType::YCbCr(8) => data,
        ColorType::RGBA(8) => data
            .chunks_exact(4)
            .flat_map(|p| [p[0], p[1], p[2]])
            .collect(),
        ColorType::Gray(8) => data.iter().flat_map(|&g| [g, g, g]).collect(),
        other => bail!("unsupported sample layout {other:?}"),
    };
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow::anyhow!("pixel buffer does not match {width}x{height}"))
}
