//! On-disk cache of encoded terrain tiles
//!
//! Content-addressed store under
//! `{root}/{fingerprint}/{method}/{resampling}/{extensions}/{z}/{x}/{y}.terrain`.
//! The fingerprint folds in every dataset-level option and the extensions
//! segment separates bodies with and without the octvertexnormals block,
//! so a path maps to exactly one encoding and a cached body can never be
//! served under a Content-Type that promises a different extension set.
//! Writes go through a tempfile in the target directory followed by an
//! atomic rename, and a startup sweep clears tempfiles left behind by a
//! crash. The whole tree is safe to delete at any time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::cog::Resampling;
use crate::core::error::Result;
use crate::core::meshing::MeshingMethod;
use crate::core::tms::TileKey;
use crate::core::window::DatasetFingerprint;

const TMP_SUFFIX: &str = ".tmp";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Path segment naming the quantized-mesh extensions baked into the body
fn extensions_segment(with_normals: bool) -> &'static str {
    if with_normals {
        "octvertexnormals"
    } else {
        "none"
    }
}

pub struct TileDiskCache {
    root: PathBuf,
}

impl TileDiskCache {
    /// Open (creating if needed) a cache rooted at `root` and sweep
    /// tempfiles abandoned by a previous crash.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let cache = Self { root };
        cache.sweep();
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tile_path(
        &self,
        fingerprint: &DatasetFingerprint,
        method: MeshingMethod,
        resampling: Resampling,
        with_normals: bool,
        tile: &TileKey,
    ) -> PathBuf {
        self.root
            .join(fingerprint.to_hex())
            .join(method.name())
            .join(resampling.name())
            .join(extensions_segment(with_normals))
            .join(tile.z.to_string())
            .join(tile.x.to_string())
            .join(format!("{}.terrain", tile.y))
    }

    pub fn read(
        &self,
        fingerprint: &DatasetFingerprint,
        method: MeshingMethod,
        resampling: Resampling,
        with_normals: bool,
        tile: &TileKey,
    ) -> Option<Vec<u8>> {
        let path = self.tile_path(fingerprint, method, resampling, with_normals, tile);
        std::fs::read(path).ok()
    }

    /// Atomically persist a tile: write a tempfile next to the target,
    /// then rename over it. A concurrent writer for the same path just
    /// wins or loses the rename; both leave a complete file.
    pub fn write(
        &self,
        fingerprint: &DatasetFingerprint,
        method: MeshingMethod,
        resampling: Resampling,
        with_normals: bool,
        tile: &TileKey,
        data: &[u8],
    ) -> Result<()> {
        let path = self.tile_path(fingerprint, method, resampling, with_normals, tile);
        let dir = path.parent().expect("tile path always has a parent");
        std::fs::create_dir_all(dir)?;

        let tmp = dir.join(format!(
            "{}.terrain{}{}-{}",
            tile.y,
            TMP_SUFFIX,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed),
        ));
        std::fs::write(&tmp, data)?;
        match std::fs::rename(&tmp, &path) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = std::fs::remove_file(&tmp);
                Err(err.into())
            }
        }
    }

    /// Remove tempfiles left over from interrupted writes
    fn sweep(&self) {
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(TMP_SUFFIX))
                {
                    if std::fs::remove_file(&path).is_ok() {
                        tracing::debug!("removed stray tempfile {}", path.display());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::meshing::DetailTables;

    fn fingerprint() -> DatasetFingerprint {
        DatasetFingerprint::compute("disk-test.tif", 0.0, &DetailTables::default())
    }

    fn tile() -> TileKey {
        TileKey::new(12, 2048, 1365)
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileDiskCache::open(dir.path()).unwrap();
        let fp = fingerprint();

        assert!(cache
            .read(&fp, MeshingMethod::Grid, Resampling::Bilinear, true, &tile())
            .is_none());
        cache
            .write(
                &fp,
                MeshingMethod::Grid,
                Resampling::Bilinear,
                true,
                &tile(),
                b"terrain-bytes",
            )
            .unwrap();
        let read = cache
            .read(&fp, MeshingMethod::Grid, Resampling::Bilinear, true, &tile())
            .unwrap();
        assert_eq!(read, b"terrain-bytes");
        // A body without the normals block lives at a different path
        assert!(cache
            .read(&fp, MeshingMethod::Grid, Resampling::Bilinear, false, &tile())
            .is_none());
    }

    #[test]
    fn test_path_separates_options() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileDiskCache::open(dir.path()).unwrap();
        let fp = fingerprint();
        let a = cache.tile_path(&fp, MeshingMethod::Grid, Resampling::Bilinear, true, &tile());
        let b = cache.tile_path(&fp, MeshingMethod::Martini, Resampling::Bilinear, true, &tile());
        let c = cache.tile_path(&fp, MeshingMethod::Grid, Resampling::None, true, &tile());
        let d = cache.tile_path(&fp, MeshingMethod::Grid, Resampling::Bilinear, false, &tile());
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a
            .to_string_lossy()
            .ends_with("grid/bilinear/octvertexnormals/12/2048/1365.terrain"));
        assert!(d
            .to_string_lossy()
            .ends_with("grid/bilinear/none/12/2048/1365.terrain"));
    }

    #[test]
    fn test_sweep_removes_stray_tempfiles() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("abc/grid/bilinear/octvertexnormals/5/1");
        std::fs::create_dir_all(&nested).unwrap();
        let stray = nested.join("7.terrain.tmp999-0");
        std::fs::write(&stray, b"partial").unwrap();
        let finished = nested.join("7.terrain");
        std::fs::write(&finished, b"complete").unwrap();

        let _cache = TileDiskCache::open(dir.path()).unwrap();

        assert!(!stray.exists(), "tempfile survived the sweep");
        assert!(finished.exists(), "finished tile was removed");
    }

    #[test]
    fn test_write_leaves_no_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileDiskCache::open(dir.path()).unwrap();
        let fp = fingerprint();
        cache
            .write(&fp, MeshingMethod::Delatin, Resampling::None, false, &tile(), b"x")
            .unwrap();

        let mut stack = vec![dir.path().to_path_buf()];
        while let Some(d) = stack.pop() {
            for entry in std::fs::read_dir(&d).unwrap().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    assert!(!path.to_string_lossy().contains(TMP_SUFFIX));
                }
            }
        }
    }
}
