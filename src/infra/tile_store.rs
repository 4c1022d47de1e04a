// ============================================================
// Layer 6 — Tile Store
// ============================================================
// Extraction is by far the slowest step of the pipeline (decode
// a TIFF page, scan the grid, Lab-convert every tissue pixel).
// The tile store caches its output in one SQLite file so every
// training epoch and every fold reads raw tile bytes instead.
//
// Schema:
//   meta  (key TEXT PRIMARY KEY, value TEXT)
//           'manifest' → JSON StoreManifest (tiling parameters,
//                        pyramid level, Reinhard target)
//   tiles (tile_name TEXT PRIMARY KEY,   -- "{image_id}_{grid index}"
//          slide_id, position,           -- rank inside the bag
//          grid_index, label, intensity_sum, tissue_fraction,
//          size, pixels BLOB)            -- RGB8, row-major
//
// Only real tiles are stored; bags are padded with blanks when
// they are read back.
//
// Training opens the store read-only. The connection sits behind
// a mutex so the datasets built on top are Send + Sync and can
// be shared with the DataLoader worker threads.

use anyhow::{bail, Context, Result};
use image::RgbImage;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::data::{slide_reader::PyramidLevel, stain::LabTarget, tiler::TilingConfig};
use crate::domain::tile::{Tile, TileLabel};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS tiles (
        tile_name       TEXT PRIMARY KEY,
        slide_id        TEXT NOT NULL,
        position        INTEGER NOT NULL,
        grid_index      INTEGER NOT NULL,
        label           INTEGER NOT NULL,
        intensity_sum   INTEGER NOT NULL,
        tissue_fraction REAL NOT NULL,
        size            INTEGER NOT NULL,
        pixels          BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS tiles_by_slide ON tiles (slide_id, position);
";

/// How the tiles in a store were produced. Prediction re-tiles
/// slides with exactly these parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub tiling:     TilingConfig,
    pub level:      PyramidLevel,
    /// Reinhard target the tiles were normalized to, if any.
    pub normalizer: Option<LabTarget>,
}

/// A tile read back from the store with its name.
#[derive(Debug, Clone)]
pub struct StoredTile {
    pub name: String,
    pub tile: Tile,
}

// ─── Reader ───────────────────────────────────────────────────────────────────
pub struct TileStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl TileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            bail!(
                "Tile store '{}' does not exist. Run 'extract' first.",
                path.display()
            );
        }
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Cannot open tile store '{}'", path.display()))?;
        Ok(Self { path, conn: Mutex::new(conn) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> Result<StoreManifest> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'manifest'", [], |r| r.get(0))
            .optional()?;
        let json = json.with_context(|| {
            format!("Tile store '{}' has no manifest", self.path.display())
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn tiling_config(&self) -> Result<TilingConfig> {
        Ok(self.manifest()?.tiling)
    }

    pub fn slide_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT slide_id FROM tiles ORDER BY slide_id")?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Tile names of one slide in bag order.
    pub fn tile_names(&self, slide_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tile_name FROM tiles WHERE slide_id = ?1 ORDER BY position",
        )?;
        let names = stmt
            .query_map(params![slide_id], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    pub fn read_tile(&self, tile_name: &str) -> Result<Option<StoredTile>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT tile_name, grid_index, label, intensity_sum, tissue_fraction, size, pixels
                 FROM tiles WHERE tile_name = ?1",
                params![tile_name],
                TileRow::from_row,
            )
            .optional()?;
        row.map(TileRow::into_stored).transpose()
    }

    /// Every stored tile of a slide in bag order. An unknown slide
    /// gives an empty list.
    pub fn slide_tiles(&self, slide_id: &str) -> Result<Vec<StoredTile>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tile_name, grid_index, label, intensity_sum, tissue_fraction, size, pixels
             FROM tiles WHERE slide_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map(params![slide_id], TileRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(TileRow::into_stored).collect()
    }
}

struct TileRow {
    name:            String,
    grid_index:      i64,
    label:           i64,
    intensity_sum:   i64,
    tissue_fraction: f64,
    size:            u32,
    pixels:          Vec<u8>,
}

impl TileRow {
    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name:            r.get(0)?,
            grid_index:      r.get(1)?,
            label:           r.get(2)?,
            intensity_sum:   r.get(3)?,
            tissue_fraction: r.get(4)?,
            size:            r.get(5)?,
            pixels:          r.get(6)?,
        })
    }

    fn into_stored(self) -> Result<StoredTile> {
        let pixels = RgbImage::from_raw(self.size, self.size, self.pixels).with_context(|| {
            format!("Tile '{}' does not hold {}x{} RGB pixels", self.name, self.size, self.size)
        })?;
        let tile = Tile {
            pixels,
            source_index:    Some(self.grid_index.max(0) as usize),
            intensity_sum:   self.intensity_sum.max(0) as u64,
            tissue_fraction: self.tissue_fraction as f32,
            label:           TileLabel::from_raw(self.label),
        };
        Ok(StoredTile { name: self.name, tile })
    }
}

// ─── Writer ───────────────────────────────────────────────────────────────────
pub struct TileStoreWriter {
    conn:    Connection,
    written: usize,
}

impl TileStoreWriter {
    /// Open (or create) a store for writing and record how its
    /// tiles are produced. Re-extracting into an existing store
    /// with different parameters is refused.
    pub fn create(path: impl AsRef<Path>, manifest: &StoreManifest) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Cannot create tile store '{}'", path.display()))?;
        conn.execute_batch(SCHEMA)?;

        let existing: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'manifest'", [], |r| r.get(0))
            .optional()?;
        match existing {
            Some(json) => {
                let existing: StoreManifest = serde_json::from_str(&json)?;
                if &existing != manifest {
                    bail!(
                        "Tile store '{}' was built with different tiling parameters",
                        path.display()
                    );
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('manifest', ?1)",
                    params![serde_json::to_string(manifest)?],
                )?;
            }
        }
        Ok(Self { conn, written: 0 })
    }

    /// Replace every stored tile of `slide_id` in one transaction.
    /// `tiles` pairs each tile name with the tile; blanks are skipped.
    pub fn write_slide(&mut self, slide_id: &str, tiles: &[(String, &Tile)]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tiles WHERE slide_id = ?1", params![slide_id])?;
        let mut count = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO tiles
                 (tile_name, slide_id, position, grid_index, label, intensity_sum,
                  tissue_fraction, size, pixels)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (position, (name, tile)) in tiles.iter().enumerate() {
                let Some(grid_index) = tile.source_index else {
                    continue;
                };
                stmt.execute(params![
                    name,
                    slide_id,
                    position as i64,
                    grid_index as i64,
                    tile.label.raw() as i64,
                    tile.intensity_sum as i64,
                    tile.tissue_fraction as f64,
                    tile.size(),
                    tile.pixels.as_raw(),
                ])?;
                count += 1;
            }
        }
        tx.commit()?;
        self.written += count;
        Ok(count)
    }

    pub fn tiles_written(&self) -> usize {
        self.written
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn manifest() -> StoreManifest {
        StoreManifest {
            tiling:     TilingConfig { tile_size: 4, top_n: 3, ..TilingConfig::default() },
            level:      PyramidLevel::Lowest,
            normalizer: Some(LabTarget::default()),
        }
    }

    fn tile(index: usize, value: u8, label: i64) -> Tile {
        Tile {
            pixels:          RgbImage::from_pixel(4, 4, Rgb([value, value / 2, 255 - value])),
            source_index:    Some(index),
            intensity_sum:   (value as u64) * 48,
            tissue_fraction: 1.0,
            label:           TileLabel::checked(label, 6),
        }
    }

    #[test]
    fn test_write_then_read_slide() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.db");

        let a = tile(7, 40, 2);
        let b = tile(3, 90, -1);
        let blank = Tile::blank(4);
        {
            let mut w = TileStoreWriter::create(&path, &manifest()).unwrap();
            let n = w
                .write_slide("s1", &[("s1_7".into(), &a), ("s1_3".into(), &b), ("pad".into(), &blank)])
                .unwrap();
            assert_eq!(n, 2);
            assert_eq!(w.tiles_written(), 2);
        }

        let store = TileStore::open(&path).unwrap();
        assert_eq!(store.manifest().unwrap(), manifest());
        assert_eq!(store.tiling_config().unwrap().tile_size, 4);
        assert_eq!(store.slide_ids().unwrap(), vec!["s1".to_string()]);
        assert_eq!(store.tile_names("s1").unwrap(), vec!["s1_7", "s1_3"]);

        let tiles = store.slide_tiles("s1").unwrap();
        assert_eq!(tiles.len(), 2);
        assert_eq!(tiles[0].tile.source_index, Some(7));
        assert_eq!(tiles[0].tile.label.raw(), 2);
        assert_eq!(tiles[0].tile.pixels, a.pixels);
        assert_eq!(tiles[1].tile.label, TileLabel::INVALID);

        let one = store.read_tile("s1_3").unwrap().unwrap();
        assert_eq!(one.tile.pixels, b.pixels);
        assert!(store.read_tile("nope").unwrap().is_none());
        assert!(store.slide_tiles("unknown").unwrap().is_empty());
    }

    #[test]
    fn test_rewriting_a_slide_replaces_its_tiles() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.db");
        let mut w = TileStoreWriter::create(&path, &manifest()).unwrap();
        w.write_slide("s1", &[("s1_1".into(), &tile(1, 10, 0)), ("s1_2".into(), &tile(2, 20, 0))])
            .unwrap();
        w.write_slide("s1", &[("s1_5".into(), &tile(5, 10, 0))]).unwrap();
        drop(w);

        let store = TileStore::open(&path).unwrap();
        assert_eq!(store.tile_names("s1").unwrap(), vec!["s1_5"]);
    }

    #[test]
    fn test_manifest_mismatch_is_refused() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.db");
        TileStoreWriter::create(&path, &manifest()).unwrap();

        let mut other = manifest();
        other.tiling.top_n = 99;
        assert!(TileStoreWriter::create(&path, &other).is_err());
        // same parameters reopen fine
        assert!(TileStoreWriter::create(&path, &manifest()).is_ok());
    }

    #[test]
    fn test_missing_store() {
        assert!(TileStore::open("/no/such/tiles.db").is_err());
    }
}
