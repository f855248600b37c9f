use serde::Deserialize;
use serde::Serialize;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

/// One sequencing read aligned over a region. The upstream alignment-file
/// reader is an external collaborator; reads arrive already extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignedRead {
    /// Base calls, ACGTN.
    pub sequence: String,
    /// Phred quality per base, parallel to `sequence`.
    pub quals: Vec<u8>,
    /// Alignment start relative to the region start (soft clips included).
    pub offset: i64,
    /// True for reverse-strand alignments.
    pub reverse: bool,
    /// Leading soft/hard-clipped length.
    #[serde(default)]
    pub clipped: usize,
}

/// A genomic interval with its pileup and ground-truth haplotype.
/// Immutable once read from source; identified by (chrom, start, end).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub reads: Vec<AlignedRead>,
    /// Target haplotype sequence the model learns to predict.
    pub haplotype: String,
}

impl Region {
    /// Stream regions from a JSONL file, one Region per line. Unparseable
    /// lines are surfaced as errors for the caller's skip policy.
    pub fn stream(path: &Path) -> std::io::Result<impl Iterator<Item = serde_json::Result<Region>>> {
        let reader = BufReader::new(std::fs::File::open(path)?);
        Ok(reader
            .lines()
            .map_while(|l| l.ok())
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(&l)))
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
    }
}
