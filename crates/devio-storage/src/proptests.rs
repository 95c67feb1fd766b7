use crate::{AligningStream, CombinedSeekStream, MemStream, Result, Stream, SubStream};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;
use std::io::SeekFrom;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u32, data: Vec<u8> },
    Read { offset: u32, len: usize },
}

const MAX_SECTORS: u32 = 256;
const MAX_OPS: usize = 48;
const MAX_RW_LEN: usize = 12 * 1024;

/// Backing stream wrapper that records every physical read/write that is not aligned.
struct AlignmentChecked {
    inner: MemStream,
    alignment: u64,
    violations: Vec<(&'static str, u64, usize)>,
}

impl AlignmentChecked {
    fn new(len: u64, alignment: u32) -> Self {
        Self {
            inner: MemStream::with_len(len).unwrap().fixed(),
            alignment: u64::from(alignment),
            violations: Vec::new(),
        }
    }

    fn check(&mut self, op: &'static str, len: usize) {
        let pos = self.inner.position();
        if pos % self.alignment != 0 || len as u64 % self.alignment != 0 {
            self.violations.push((op, pos, len));
        }
    }
}

impl Stream for AlignmentChecked {
    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.inner.seek(pos)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check("read", buf.len());
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check("write", buf.len());
        self.inner.write(buf)
    }
}

fn alignment_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![Just(512u32), Just(1024u32), Just(4096u32)]
}

fn offset_strategy(size: u32, alignment: u32) -> BoxedStrategy<u32> {
    let any = 0u32..=size;
    let aligned = (0u32..=size / alignment).prop_map(move |blk| blk * alignment);
    let boundary_plus_delta = (0u32..=size / alignment, 0u32..alignment)
        .prop_map(move |(blk, delta)| (blk * alignment + delta).min(size));
    let near_end = (0u32..=alignment).prop_map(move |delta| size.saturating_sub(delta));

    prop_oneof![
        4 => any,
        2 => aligned,
        3 => boundary_plus_delta,
        1 => near_end,
    ]
    .boxed()
}

fn op_strategy(size: u32, alignment: u32) -> BoxedStrategy<Op> {
    let write = offset_strategy(size, alignment)
        .prop_flat_map(move |offset| {
            let max_len = ((size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
        })
        .prop_map(|(offset, data)| Op::Write { offset, data });
    let read = offset_strategy(size, alignment)
        .prop_flat_map(move |offset| {
            // Reads may run past the end; the stream must clamp them.
            (Just(offset), 0usize..=MAX_RW_LEN)
        })
        .prop_map(|(offset, len)| Op::Read { offset, len });
    prop_oneof![5 => write, 4 => read].boxed()
}

fn scenario_strategy() -> BoxedStrategy<(u32, u32, Vec<Op>)> {
    (alignment_strategy(), 1u32..=MAX_SECTORS)
        .prop_flat_map(|(alignment, sectors)| {
            let size = sectors * 512;
            let size = size.div_ceil(alignment) * alignment;
            (
                Just(alignment),
                Just(size),
                prop::collection::vec(op_strategy(size, alignment), 1..=MAX_OPS),
            )
        })
        .boxed()
}

fn run_ops<S: Stream>(stream: &mut S, model: &mut [u8], ops: &[Op]) -> TestCaseResult {
    prop_assert_eq!(stream.len().unwrap(), model.len() as u64);
    for op in ops {
        match op {
            Op::Write { offset, data } => {
                let offset = *offset as usize;
                stream.seek(SeekFrom::Start(offset as u64)).unwrap();
                prop_assert_eq!(stream.write(data).unwrap(), data.len());
                prop_assert_eq!(stream.position(), (offset + data.len()) as u64);
                model[offset..offset + data.len()].copy_from_slice(data);

                let mut back = vec![0xA5u8; data.len()];
                stream.seek(SeekFrom::Start(offset as u64)).unwrap();
                prop_assert_eq!(stream.read_full(&mut back).unwrap(), data.len());
                prop_assert_eq!(back.as_slice(), data.as_slice());
            }
            Op::Read { offset, len } => {
                let offset = *offset as usize;
                let expected = (*len).min(model.len().saturating_sub(offset));
                let mut buf = vec![0xA5u8; *len];
                stream.seek(SeekFrom::Start(offset as u64)).unwrap();
                let n = stream.read_full(&mut buf).unwrap();
                prop_assert_eq!(n, expected);
                prop_assert_eq!(&buf[..n], &model[offset..offset + n]);
                prop_assert_eq!(stream.position(), (offset + n) as u64);
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_aligning_stream_only_issues_aligned_io((alignment, size, ops) in scenario_strategy()) {
        let mut backing = AlignmentChecked::new(u64::from(size), alignment);
        let mut model = vec![0u8; size as usize];
        {
            let mut stream = AligningStream::new(&mut backing, alignment, 0).unwrap();
            run_ops(&mut stream, &mut model, &ops)?;
        }
        prop_assert!(backing.violations.is_empty(), "misaligned backing I/O: {:?}", backing.violations);
        prop_assert_eq!(backing.inner.as_slice(), model.as_slice());
    }

    #[test]
    fn prop_sub_stream_over_aligning_stream_matches_reference(
        (alignment, size, ops) in scenario_strategy(),
        head in 0u32..2048,
    ) {
        let parent_len = u64::from(size) + u64::from(head) * 2;
        let parent_len = parent_len.div_ceil(u64::from(alignment)) * u64::from(alignment);
        let mut backing = AlignmentChecked::new(parent_len, alignment);
        let mut model = vec![0u8; size as usize];
        {
            let aligned = AligningStream::new(&mut backing, alignment, 0).unwrap();
            let mut sub = SubStream::new(aligned, u64::from(head), u64::from(size)).unwrap();
            run_ops(&mut sub, &mut model, &ops)?;
        }
        prop_assert!(backing.violations.is_empty(), "misaligned backing I/O: {:?}", backing.violations);
        let window = &backing.inner.as_slice()[head as usize..head as usize + size as usize];
        prop_assert_eq!(window, model.as_slice());
    }

    #[test]
    fn prop_combined_stream_matches_reference(
        (_alignment, size, ops) in scenario_strategy(),
        cuts in prop::collection::vec(0u32..=MAX_SECTORS * 512, 0..4),
    ) {
        let mut cuts: Vec<u32> = cuts.into_iter().map(|c| c.min(size)).collect();
        cuts.push(0);
        cuts.push(size);
        cuts.sort_unstable();
        let members: Vec<MemStream> = cuts
            .windows(2)
            .map(|w| MemStream::with_len(u64::from(w[1] - w[0])).unwrap().fixed())
            .collect();
        let mut combined = CombinedSeekStream::new(members).unwrap();
        prop_assert_eq!(combined.len().unwrap(), u64::from(size));

        let mut model = vec![0u8; size as usize];
        run_ops(&mut combined, &mut model, &ops)?;

        for offset in [0u64, u64::from(size) / 2, u64::from(size).saturating_sub(1)] {
            combined.seek(SeekFrom::Start(offset)).unwrap();
            let (end, local) = combined.current_member().unwrap();
            prop_assert!(offset < end);
            prop_assert_eq!(combined.physical_position(), local);
        }
    }
}
