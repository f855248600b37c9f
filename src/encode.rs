use crate::Feature;
use crate::Token;
use crate::error::Result;
use crate::error::VarformerError;
use crate::pileup::AlignedRead;
use crate::pileup::Region;

/// One region encoded into a fixed-shape feature block plus its target
/// label sequence. `src` is laid out `[max_read_depth, feats_per_read, window]`
/// row-major; slots beyond the available read depth stay zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedExample {
    pub src: Vec<Feature>,
    pub labels: Vec<Token>,
}

/// Deterministic Region -> EncodedExample conversion. Re-encoding the same
/// Region yields bit-identical output: read selection is a stable sort by
/// (alignment offset, sequence) truncated to `max_read_depth`.
#[derive(Debug, Clone, Copy)]
pub struct RegionEncoder {
    pub max_read_depth: usize,
    pub feats_per_read: usize,
    pub window: usize,
    pub label_len: usize,
}

impl RegionEncoder {
    pub fn new(max_read_depth: usize, feats_per_read: usize, window: usize, label_len: usize) -> Self {
        Self {
            max_read_depth,
            feats_per_read,
            window,
            label_len,
        }
    }

    /// Flat length of one encoded feature block.
    pub fn src_len(&self) -> usize {
        self.max_read_depth * self.feats_per_read * self.window
    }

    pub fn encode(&self, region: &Region) -> Result<EncodedExample> {
        if region.reads.is_empty() {
            return Err(self.invalid(region, "zero reads"));
        }
        if region.haplotype.is_empty() {
            return Err(self.invalid(region, "missing haplotype"));
        }
        let labels = self.labels(region)?;
        let mut src = vec![0 as Feature; self.src_len()];
        for (slot, read) in self.select(region).iter().enumerate() {
            self.fill(&mut src, slot, read);
        }
        Ok(EncodedExample { src, labels })
    }

    /// Stable read selection: sort by (offset, sequence), truncate to depth.
    fn select<'a>(&self, region: &'a Region) -> Vec<&'a AlignedRead> {
        let mut reads = region.reads.iter().collect::<Vec<_>>();
        reads.sort_by(|a, b| (a.offset, &a.sequence).cmp(&(b.offset, &b.sequence)));
        reads.truncate(self.max_read_depth);
        reads
    }

    fn fill(&self, src: &mut [Feature], slot: usize, read: &AlignedRead) {
        for (i, base) in read.sequence.bytes().enumerate() {
            let pos = read.offset + i as i64;
            if pos < 0 || pos >= self.window as i64 {
                continue;
            }
            let pos = pos as usize;
            let qual = read.quals.get(i).copied().unwrap_or(0);
            let clipped = i < read.clipped;
            for (channel, value) in basecall(base, qual, read.reverse, clipped) {
                if channel < self.feats_per_read {
                    src[self.index(slot, channel, pos)] = value;
                }
            }
        }
    }

    fn index(&self, slot: usize, channel: usize, pos: usize) -> usize {
        (slot * self.feats_per_read + channel) * self.window + pos
    }

    /// Haplotype string -> token sequence, padded/truncated to `label_len`.
    fn labels(&self, region: &Region) -> Result<Vec<Token>> {
        let mut labels = Vec::with_capacity(self.label_len);
        for c in region.haplotype.bytes().take(self.label_len) {
            labels.push(base_token(c).ok_or_else(|| {
                self.invalid(region, &format!("unexpected haplotype base {:?}", c as char))
            })?);
        }
        labels.resize(self.label_len, crate::TOKEN_PAD);
        Ok(labels)
    }

    fn invalid(&self, region: &Region, reason: &str) -> VarformerError {
        VarformerError::InvalidRegion {
            chrom: region.chrom.clone(),
            start: region.start,
            end: region.end,
            reason: reason.to_string(),
        }
    }
}

/// Canonical per-base channels: one-hot base (N sets all four), scaled
/// quality, ref-consumed, read-consumed, strand, clipped.
fn basecall(base: u8, qual: u8, reverse: bool, clipped: bool) -> Vec<(usize, Feature)> {
    let mut channels = Vec::with_capacity(crate::CANONICAL_FEATS);
    match base.to_ascii_uppercase() {
        b'A' => channels.push((0, 1)),
        b'C' => channels.push((1, 1)),
        b'G' => channels.push((2, 1)),
        b'T' => channels.push((3, 1)),
        b'N' => channels.extend([(0, 1), (1, 1), (2, 1), (3, 1)]),
        _ => {}
    }
    channels.push((4, ((qual as u16 + 5) / 10).min(127) as Feature));
    channels.push((5, 1));
    channels.push((6, 1));
    channels.push((7, if reverse { 1 } else { 0 }));
    channels.push((8, if clipped { 1 } else { 0 }));
    channels
}

/// Label vocabulary: PAD=0, START=1, then A/C/G/T.
pub fn base_token(base: u8) -> Option<Token> {
    match base.to_ascii_uppercase() {
        b'A' => Some(2),
        b'C' => Some(3),
        b'G' => Some(4),
        b'T' => Some(5),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(reads: Vec<AlignedRead>) -> Region {
        Region {
            chrom: "chr1".to_string(),
            start: 1000,
            end: 1150,
            reads,
            haplotype: "ACGT".to_string(),
        }
    }

    fn read(offset: i64, sequence: &str) -> AlignedRead {
        AlignedRead {
            sequence: sequence.to_string(),
            quals: vec![30; sequence.len()],
            offset,
            reverse: false,
            clipped: 0,
        }
    }

    #[test]
    fn output_shape_is_exact() {
        let encoder = RegionEncoder::new(5, 9, 20, 10);
        let encoded = encoder.encode(&region(vec![read(0, "ACGT")])).unwrap();
        assert!(encoded.src.len() == 5 * 9 * 20);
        assert!(encoded.labels.len() == 10);
    }

    #[test]
    fn pad_slots_are_zero() {
        let encoder = RegionEncoder::new(5, 9, 20, 10);
        let encoded = encoder.encode(&region(vec![read(0, "ACGT")])).unwrap();
        // slots 1..5 never touched by the single read
        assert!(encoded.src[9 * 20..].iter().all(|&f| f == 0));
    }

    #[test]
    fn encoding_is_deterministic() {
        let encoder = RegionEncoder::new(3, 9, 20, 10);
        let r = region(vec![read(4, "ACGT"), read(0, "TTTT"), read(4, "AAAA")]);
        assert!(encoder.encode(&r).unwrap() == encoder.encode(&r).unwrap());
    }

    #[test]
    fn depth_overflow_selects_by_stable_order() {
        let encoder = RegionEncoder::new(1, 9, 20, 10);
        let r = region(vec![read(4, "CCCC"), read(0, "AAAA")]);
        let encoded = encoder.encode(&r).unwrap();
        // kept read is the offset-0 one: A one-hot at channel 0, position 0
        assert!(encoded.src[0] == 1);
    }

    #[test]
    fn quality_is_scaled_with_rounding() {
        let encoder = RegionEncoder::new(1, 9, 4, 4);
        let mut r = region(vec![read(0, "A")]);
        r.reads[0].quals = vec![37];
        let encoded = encoder.encode(&r).unwrap();
        assert!(encoded.src[4 * 4] == 4);
        r.reads[0].quals = vec![34];
        let encoded = encoder.encode(&r).unwrap();
        assert!(encoded.src[4 * 4] == 3);
    }

    #[test]
    fn zero_reads_is_invalid() {
        let encoder = RegionEncoder::new(5, 9, 20, 10);
        match encoder.encode(&region(vec![])) {
            Err(VarformerError::InvalidRegion { .. }) => {}
            other => panic!("expected InvalidRegion, got {:?}", other),
        }
    }

    #[test]
    fn bad_haplotype_base_is_invalid() {
        let encoder = RegionEncoder::new(5, 9, 20, 10);
        let mut r = region(vec![read(0, "ACGT")]);
        r.haplotype = "ACXT".to_string();
        assert!(matches!(
            encoder.encode(&r),
            Err(VarformerError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn labels_pad_to_fixed_length() {
        let encoder = RegionEncoder::new(5, 9, 20, 8);
        let encoded = encoder.encode(&region(vec![read(0, "ACGT")])).unwrap();
        assert!(encoded.labels == vec![2, 3, 4, 5, 0, 0, 0, 0]);
    }
}
