use crate::ParseError;

/// The chunk number under which a split TSE's split-info record is served.
pub const SPLIT_INFO_CHUNK: i64 = 999_999_999;

/// A blob's primary identity: storage satellite plus intra-satellite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId {
    pub sat: i32,
    pub sat_key: i64,
}

impl BlobId {
    pub fn new(sat: i32, sat_key: i64) -> Self {
        Self { sat, sat_key }
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.sat, self.sat_key)
    }
}

impl std::str::FromStr for BlobId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseError::MalformedBlobId(s.to_string());
        let (sat, sat_key) = s.split_once('.').ok_or_else(malformed)?;
        // `parse::<i32>` accepts a leading '+'; the wire form does not.
        if sat.starts_with('+') || sat_key.starts_with('+') {
            return Err(malformed());
        }
        let sat: i32 = sat.parse().map_err(|_| malformed())?;
        let sat_key: i64 = sat_key.parse().map_err(|_| malformed())?;
        if sat < 0 || sat_key < 0 {
            return Err(malformed());
        }
        Ok(Self { sat, sat_key })
    }
}

/// A single chunk of a split TSE, addressed by its parent blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub parent: BlobId,
    pub chunk_no: i64,
}

/// The `sat.info.chunks[.split_version]` pointer stored on a split blob's
/// properties, identifying its split representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id2Info {
    sat: i32,
    info: i32,
    chunks: i32,
    split_version: i32,
}

impl Id2Info {
    pub fn sat(&self) -> i32 {
        self.sat
    }

    pub fn info(&self) -> i32 {
        self.info
    }

    pub fn chunks(&self) -> i32 {
        self.chunks
    }

    pub fn split_version(&self) -> i32 {
        self.split_version
    }

    /// The sat_key of data chunk `chunk_no`, valid for `1..=chunks`.
    pub fn chunk_sat_key(&self, chunk_no: i64) -> i64 {
        self.info as i64 - self.chunks as i64 - 1 + chunk_no
    }

    /// The sat_key of the split-info record itself.
    pub fn split_info_sat_key(&self) -> i64 {
        self.info as i64
    }
}

impl std::fmt::Display for Id2Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.split_version != 0 {
            write!(
                f,
                "{}.{}.{}.{}",
                self.sat, self.info, self.chunks, self.split_version
            )
        } else {
            write!(f, "{}.{}.{}", self.sat, self.info, self.chunks)
        }
    }
}

impl std::str::FromStr for Id2Info {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidId2Info(s.to_string());
        let mut parts = s.split('.');

        let mut next_int = |required: bool| -> Result<Option<i32>, ParseError> {
            match parts.next() {
                Some(p) => {
                    if p.starts_with('+') {
                        return Err(invalid());
                    }
                    let v: i32 = p.parse().map_err(|_| invalid())?;
                    if v < 0 {
                        return Err(invalid());
                    }
                    Ok(Some(v))
                }
                None if required => Err(invalid()),
                None => Ok(None),
            }
        };

        let sat = next_int(true)?.unwrap_or_default();
        let info = next_int(true)?.unwrap_or_default();
        let chunks = next_int(true)?.unwrap_or_default();
        let split_version = next_int(false)?.unwrap_or(0);
        if parts.next().is_some() || chunks < 1 {
            return Err(invalid());
        }

        Ok(Self {
            sat,
            info,
            chunks,
            split_version,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blob_id_round_trip() {
        let id: BlobId = "4.12345".parse().unwrap();
        assert_eq!(id, BlobId::new(4, 12345));
        assert_eq!(id.to_string(), "4.12345");
    }

    #[test]
    fn blob_id_rejects_bad_forms() {
        for bad in ["4", "4.", ".5", "4.-5", "-4.5", "4.5.6", "a.b", "", "4.+5"] {
            assert!(bad.parse::<BlobId>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn id2_info_three_fields() {
        let info: Id2Info = "4.1000.3".parse().unwrap();
        assert_eq!((info.sat(), info.info(), info.chunks()), (4, 1000, 3));
        assert_eq!(info.split_version(), 0);
        assert_eq!(info.to_string(), "4.1000.3");
    }

    #[test]
    fn id2_info_with_split_version() {
        let info: Id2Info = "4.1000.3.7".parse().unwrap();
        assert_eq!(info.split_version(), 7);
        assert_eq!(info.to_string(), "4.1000.3.7");
    }

    #[test]
    fn id2_info_rejects_bad_forms() {
        for bad in ["", "4", "4.1000", "4.1000.0", "4.1000.x", "4.1000.3.7.9", "4.-1.3"] {
            assert!(bad.parse::<Id2Info>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn chunk_sat_key_arithmetic() {
        let info: Id2Info = "4.1000.3".parse().unwrap();
        // chunks occupy the keys immediately below `info`.
        assert_eq!(info.chunk_sat_key(1), 997);
        assert_eq!(info.chunk_sat_key(2), 998);
        assert_eq!(info.chunk_sat_key(3), 999);
        assert_eq!(info.split_info_sat_key(), 1000);
    }
}
