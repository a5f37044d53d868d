use serde::{Deserialize, Serialize};

use crate::BlobId;

/// The canonical record behind a resolved seq-id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BioseqInfo {
    pub accession: String,
    pub version: i32,
    pub seq_id_type: i32,
    pub gi: i64,
    pub sat: i32,
    pub sat_key: i64,
    pub tax_id: i32,
    pub mol_type: i32,
    pub length: i64,
    pub state: i32,
    pub hash: i64,
    pub date_changed: i64,
    /// `(seq_id_type, seq_id)` synonyms recorded for this bioseq.
    pub seq_ids: Vec<(i32, String)>,
}

impl BioseqInfo {
    pub fn blob_id(&self) -> BlobId {
        BlobId::new(self.sat, self.sat_key)
    }
}

// Blob state bits, lowest first.
const BLOB_STATE_DEAD: i32 = 1 << 0;
const BLOB_STATE_SUPPRESSED: i32 = 1 << 1;
const BLOB_STATE_WITHDRAWN: i32 = 1 << 2;

/// Properties of a stored blob, served ahead of its data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobProps {
    pub last_modified: i64,
    pub size: i64,
    pub size_unpacked: i64,
    pub class: i32,
    pub date_asn1: i64,
    pub div: String,
    pub flags: i32,
    pub n_chunks: i32,
    pub id2_info: String,
    pub owner: i32,
    pub username: String,
    /// Set while the blob is under a publication hold; data may not be
    /// served, only the properties themselves.
    pub hup: bool,
}

impl BlobProps {
    pub fn is_dead(&self) -> bool {
        self.flags & BLOB_STATE_DEAD != 0
    }

    pub fn is_suppressed(&self) -> bool {
        self.flags & BLOB_STATE_SUPPRESSED != 0
    }

    pub fn is_withdrawn(&self) -> bool {
        self.flags & BLOB_STATE_WITHDRAWN != 0
    }

    /// Whether blob data must be withheld from the reply.
    pub fn is_forbidden(&self) -> bool {
        self.hup || self.is_withdrawn()
    }

    pub fn set_withdrawn(&mut self) {
        self.flags |= BLOB_STATE_WITHDRAWN;
    }

    pub fn set_suppressed(&mut self) {
        self.flags |= BLOB_STATE_SUPPRESSED;
    }
}

/// One row of a split TSE's history: the id2-info string the TSE had at a
/// given split version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitHistoryRecord {
    pub sat_key: i64,
    pub split_version: i32,
    pub id2_info: String,
}

/// A named annotation attached to a bioseq.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NAnnotRecord {
    pub accession: String,
    pub version: i32,
    pub seq_id_type: i32,
    pub annot_name: String,
    pub sat: i32,
    pub sat_key: i64,
    pub start: i64,
    pub stop: i64,
}

impl NAnnotRecord {
    pub fn blob_id(&self) -> BlobId {
        BlobId::new(self.sat, self.sat_key)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blob_state_flags() {
        let mut props = BlobProps::default();
        assert!(!props.is_forbidden());

        props.set_suppressed();
        assert!(props.is_suppressed());
        assert!(!props.is_forbidden());

        props.set_withdrawn();
        assert!(props.is_withdrawn());
        assert!(props.is_forbidden());

        let hup = BlobProps {
            hup: true,
            ..BlobProps::default()
        };
        assert!(hup.is_forbidden());
    }

    #[test]
    fn bioseq_info_json_shape() {
        let info = BioseqInfo {
            accession: "NM_000170".into(),
            version: 1,
            seq_id_type: 10,
            gi: 4557232,
            sat: 4,
            sat_key: 12345,
            ..BioseqInfo::default()
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["accession"], "NM_000170");
        assert_eq!(json["version"], 1);
        assert_eq!(info.blob_id().to_string(), "4.12345");
    }
}
