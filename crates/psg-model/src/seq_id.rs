use crate::ParseError;

// Seq-id types of the INSDC partners. A lookup that fails with one of these
// types is retried with the type stripped, since the same accession may be
// recorded under a sibling type.
const INSDC_SEQ_ID_TYPES: &[i32] = &[
    5,  // GenBank
    6,  // EMBL
    7,  // DDBJ
    37, // TPG
    38, // TPE
    39, // TPD
];

pub fn is_insdc_type(seq_id_type: i32) -> bool {
    INSDC_SEQ_ID_TYPES.contains(&seq_id_type)
}

/// A textual sequence identifier, parsed into its canonical pieces where
/// possible. Identifiers that are a bare accession (no punctuation) are
/// carried through as-is rather than rejected, matching how loosely-typed
/// ids arrive from clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqId {
    text: String,
    accession: String,
    version: Option<i32>,
    seq_id_type: Option<i32>,
    parsed: bool,
}

impl SeqId {
    /// Parse `text`, honoring an explicit `seq_id_type` from the request.
    ///
    /// Accepted shapes:
    /// - `ACCESSION` (letters + digits + `_`): parsed, no version;
    /// - `ACCESSION.V`: parsed with version;
    /// - `TYPE|ACCESSION[.V]|` FASTA style, where TYPE is a known tag such
    ///   as `gb`, `emb`, `dbj`, `ref`;
    /// - anything else without punctuation: carried as-is (unparsed);
    /// - anything else with punctuation: `MalformedSeqId`.
    pub fn parse(text: &str, seq_id_type: Option<i32>) -> Result<Self, ParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ParseError::MalformedSeqId(text.to_string()));
        }

        // FASTA-style `tag|accession[.version][|]`.
        if let Some((tag, rest)) = text.split_once('|') {
            let tag_type = match tag.to_ascii_lowercase().as_str() {
                "gb" => Some(5),
                "emb" => Some(6),
                "dbj" => Some(7),
                "ref" => Some(10),
                "tpg" => Some(37),
                "tpe" => Some(38),
                "tpd" => Some(39),
                _ => None,
            };
            let Some(tag_type) = tag_type else {
                return Err(ParseError::MalformedSeqId(text.to_string()));
            };
            let body = rest.trim_end_matches('|');
            let (accession, version) = split_accession_version(body, text)?;
            return Ok(Self {
                text: text.to_string(),
                accession,
                version,
                seq_id_type: seq_id_type.or(Some(tag_type)),
                parsed: true,
            });
        }

        if is_plain_accession(text) {
            return Ok(Self {
                text: text.to_string(),
                accession: text.to_ascii_uppercase(),
                version: None,
                seq_id_type,
                parsed: true,
            });
        }

        if let Some((acc, ver)) = text.rsplit_once('.') {
            if is_plain_accession(acc) {
                if let Ok(ver) = ver.parse::<i32>() {
                    if ver >= 0 {
                        return Ok(Self {
                            text: text.to_string(),
                            accession: acc.to_ascii_uppercase(),
                            version: Some(ver),
                            seq_id_type,
                            parsed: true,
                        });
                    }
                }
            }
            return Err(ParseError::MalformedSeqId(text.to_string()));
        }

        // Unparsable but free of punctuation: resolution continues with the
        // raw text against the si2csi index.
        if text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Ok(Self {
                text: text.to_string(),
                accession: text.to_ascii_uppercase(),
                version: None,
                seq_id_type,
                parsed: false,
            });
        }

        Err(ParseError::MalformedSeqId(text.to_string()))
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn accession(&self) -> &str {
        &self.accession
    }

    pub fn version(&self) -> Option<i32> {
        self.version
    }

    pub fn seq_id_type(&self) -> Option<i32> {
        self.seq_id_type
    }

    /// Whether the id was recognized as a structured accession, as opposed
    /// to being carried through as-is.
    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    /// Derive the canonical lookup forms of this id: the primary form used
    /// against the bioseq-info index, and the secondary forms tried against
    /// the si2csi index.
    pub fn compose_oslt(&self) -> OsltIds {
        let primary = match self.version {
            Some(v) => format!("{}.{}", self.accession, v),
            None => self.accession.clone(),
        };

        let mut secondaries = vec![self.accession.clone()];
        let upper = self.text.to_ascii_uppercase();
        if upper != self.accession && upper != primary {
            secondaries.push(upper);
        }

        OsltIds {
            primary,
            secondaries,
        }
    }
}

/// The one-symbol-lookup-table decomposition of a seq-id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsltIds {
    pub primary: String,
    pub secondaries: Vec<String>,
}

fn is_plain_accession(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn split_accession_version(body: &str, full: &str) -> Result<(String, Option<i32>), ParseError> {
    if is_plain_accession(body) {
        return Ok((body.to_ascii_uppercase(), None));
    }
    if let Some((acc, ver)) = body.rsplit_once('.') {
        if is_plain_accession(acc) {
            if let Ok(ver) = ver.parse::<i32>() {
                if ver >= 0 {
                    return Ok((acc.to_ascii_uppercase(), Some(ver)));
                }
            }
        }
    }
    Err(ParseError::MalformedSeqId(full.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_accession_with_version() {
        let id = SeqId::parse("NM_000170.1", None).unwrap();
        assert!(id.is_parsed());
        assert_eq!(id.accession(), "NM_000170");
        assert_eq!(id.version(), Some(1));
        assert_eq!(id.seq_id_type(), None);
    }

    #[test]
    fn parses_bare_accession() {
        let id = SeqId::parse("ac_000001", Some(10)).unwrap();
        assert!(id.is_parsed());
        assert_eq!(id.accession(), "AC_000001");
        assert_eq!(id.version(), None);
        assert_eq!(id.seq_id_type(), Some(10));
    }

    #[test]
    fn parses_fasta_style() {
        let id = SeqId::parse("gb|U12345.2|", None).unwrap();
        assert!(id.is_parsed());
        assert_eq!(id.accession(), "U12345");
        assert_eq!(id.version(), Some(2));
        assert_eq!(id.seq_id_type(), Some(5));
    }

    #[test]
    fn explicit_type_wins_over_fasta_tag() {
        let id = SeqId::parse("gb|U12345|", Some(6)).unwrap();
        assert_eq!(id.seq_id_type(), Some(6));
    }

    #[test]
    fn rejects_punctuated_garbage() {
        assert!(SeqId::parse("NM_000170..1", None).is_err());
        assert!(SeqId::parse("zz|U12345|", None).is_err());
        assert!(SeqId::parse("", None).is_err());
        assert!(SeqId::parse("a b c", None).is_err());
    }

    #[test]
    fn numeric_leading_id_carries_as_is() {
        // Not a valid accession shape, but clean enough to try against
        // the si2csi index verbatim.
        let id = SeqId::parse("123456", None).unwrap();
        assert!(!id.is_parsed());
        assert_eq!(id.text(), "123456");
    }

    #[test]
    fn oslt_composition() {
        let id = SeqId::parse("nm_000170.1", None).unwrap();
        let oslt = id.compose_oslt();
        assert_eq!(oslt.primary, "NM_000170.1");
        assert_eq!(oslt.secondaries, vec!["NM_000170".to_string()]);
    }

    #[test]
    fn insdc_set() {
        for t in [5, 6, 7, 37, 38, 39] {
            assert!(is_insdc_type(t));
        }
        assert!(!is_insdc_type(10));
        assert!(!is_insdc_type(0));
    }
}
