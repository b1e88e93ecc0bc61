// PathManager maps blob locations to keys inside a backstore.
//
// The layout is the same for the filesystem root and for an object-store
// bucket:
//
//	<root>
//	└── zones
//	    └── <zone id>
//	        └── <first two hex chars of file id>
//	            └── <file id>
//
// Splitting on the first two characters keeps directory fan-out bounded on
// local disks. Storage paths recorded in metadata are relative to the zone
// (`<aa>/<file id>`), so a zone can be relocated by changing its root.

use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct PathManager {
    root_path: PathBuf,
}

impl PathManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        PathManager {
            root_path: root.as_ref().to_path_buf(),
        }
    }

    /// Storage path for a file id, relative to its zone,
    /// (e.g. `ab/ab12...`).
    pub fn storage_path_for(file_id: &str) -> String {
        let split = file_id.get(..2).unwrap_or(file_id);
        format!("{split}/{file_id}")
    }

    /// Object key for a blob, relative to the backstore root,
    /// (e.g. `zones/<zone>/<aa>/<file id>`).
    pub fn object_key(zone_id: i64, storage_path: &str) -> String {
        format!("zones/{zone_id}/{storage_path}")
    }

    /// Returns the path to the root of a zone,
    /// (e.g. `<root>/zones/<zone>`).
    pub fn zone_path(&self, zone_id: i64) -> PathBuf {
        self.root_path.join("zones").join(zone_id.to_string())
    }

    /// Returns the path to the data of a single blob,
    /// (e.g. `<root>/zones/<zone>/<aa>/<file id>`).
    pub fn blob_data_path(&self, zone_id: i64, storage_path: &str) -> PathBuf {
        self.root_path.join(Self::object_key(zone_id, storage_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let pm = PathManager::new("/var/lib/vstore");
        let sp = PathManager::storage_path_for("abcdef");
        assert_eq!(sp, "ab/abcdef");
        assert_eq!(PathManager::object_key(3, &sp), "zones/3/ab/abcdef");
        assert_eq!(
            pm.blob_data_path(3, &sp),
            PathBuf::from("/var/lib/vstore/zones/3/ab/abcdef")
        );
        assert_eq!(pm.zone_path(3), PathBuf::from("/var/lib/vstore/zones/3"));
    }
}
