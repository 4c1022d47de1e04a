// ============================================================
// Layer 3 — Slide Domain Type
// ============================================================
// One biopsy whole-slide image as the rest of the system sees it:
// an identifier, which lab produced it, and (for training data)
// its ISUP grade.
//
// ISUP grade groups (0–5) are derived from the Gleason score
// "primary+secondary":
//   0+0 / negative → 0     3+3 → 1     3+4 → 2     4+3 → 3
//   4+4, 3+5, 5+3  → 4     4+5, 5+4, 5+5 → 5
//
// Reference: Epstein et al. (2016) ISUP grade groups

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Number of ISUP grade groups (0..=5).
pub const NUM_ISUP_GRADES: usize = 6;

/// The lab a slide came from. The two PANDA providers annotate
/// tiles differently, so the tag travels with the slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataProvider {
    Karolinska,
    Radboud,
    #[default]
    Unknown,
}

impl FromStr for DataProvider {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "karolinska" => DataProvider::Karolinska,
            "radboud"    => DataProvider::Radboud,
            _            => DataProvider::Unknown,
        })
    }
}

impl fmt::Display for DataProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataProvider::Karolinska => "karolinska",
            DataProvider::Radboud    => "radboud",
            DataProvider::Unknown    => "unknown",
        };
        f.write_str(s)
    }
}

/// A Gleason score as written in the PANDA tables, e.g. "3+4".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GleasonScore {
    pub primary:   u8,
    pub secondary: u8,
}

impl GleasonScore {
    /// Map to the ISUP grade group. Returns None for patterns
    /// that have no grade group (e.g. "3+0").
    pub fn isup_grade(&self) -> Option<u8> {
        match (self.primary, self.secondary) {
            (0, 0)          => Some(0),
            (3, 3)          => Some(1),
            (3, 4)          => Some(2),
            (4, 3)          => Some(3),
            (4, 4) | (3, 5) | (5, 3) => Some(4),
            (4, 5) | (5, 4) | (5, 5) => Some(5),
            _               => None,
        }
    }
}

impl FromStr for GleasonScore {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("negative") {
            return Ok(GleasonScore { primary: 0, secondary: 0 });
        }
        let (p, q) = s
            .split_once('+')
            .ok_or_else(|| format!("not a Gleason score: '{s}'"))?;
        let primary = p.trim().parse::<u8>().map_err(|e| format!("'{s}': {e}"))?;
        let secondary = q.trim().parse::<u8>().map_err(|e| format!("'{s}': {e}"))?;
        Ok(GleasonScore { primary, secondary })
    }
}

/// A slide row from the slide table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slide {
    pub image_id:   String,
    pub provider:   DataProvider,
    /// Ground-truth grade; absent for unlabelled (inference) slides.
    pub isup_grade: Option<u8>,
    pub gleason:    Option<GleasonScore>,
}

impl Slide {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id:   image_id.into(),
            provider:   DataProvider::Unknown,
            isup_grade: None,
            gleason:    None,
        }
    }

    pub fn with_grade(mut self, grade: u8) -> Self {
        self.isup_grade = Some(grade);
        self
    }

    pub fn with_provider(mut self, provider: DataProvider) -> Self {
        self.provider = provider;
        self
    }

    /// The grade used for training: the explicit ISUP grade when
    /// present, otherwise the one derived from the Gleason score.
    pub fn label(&self) -> Option<u8> {
        self.isup_grade
            .or_else(|| self.gleason.and_then(|g| g.isup_grade()))
            .filter(|g| (*g as usize) < NUM_ISUP_GRADES)
    }

    /// Tile file name convention shared by the extractor and the store.
    pub fn tile_name(&self, index: usize) -> String {
        format!("{}_{}", self.image_id, index)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gleason_to_isup() {
        let cases = [
            ("negative", 0), ("0+0", 0), ("3+3", 1), ("3+4", 2), ("4+3", 3),
            ("4+4", 4), ("3+5", 4), ("5+3", 4), ("4+5", 5), ("5+4", 5), ("5+5", 5),
        ];
        for (s, grade) in cases {
            let g: GleasonScore = s.parse().unwrap();
            assert_eq!(g.isup_grade(), Some(grade), "{s}");
        }
    }

    #[test]
    fn test_gleason_rejects_garbage() {
        assert!("banana".parse::<GleasonScore>().is_err());
        assert!("3+x".parse::<GleasonScore>().is_err());
        let odd: GleasonScore = "3+0".parse().unwrap();
        assert_eq!(odd.isup_grade(), None);
    }

    #[test]
    fn test_label_falls_back_to_gleason() {
        let mut s = Slide::new("abc");
        assert_eq!(s.label(), None);
        s.gleason = Some("4+3".parse().unwrap());
        assert_eq!(s.label(), Some(3));
        let s = s.with_grade(5);
        assert_eq!(s.label(), Some(5));
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("Radboud".parse::<DataProvider>().unwrap(), DataProvider::Radboud);
        assert_eq!("karolinska".parse::<DataProvider>().unwrap(), DataProvider::Karolinska);
        assert_eq!("elsewhere".parse::<DataProvider>().unwrap(), DataProvider::Unknown);
    }

    #[test]
    fn test_tile_name() {
        assert_eq!(Slide::new("0005f7aa").tile_name(12), "0005f7aa_12");
    }
}
