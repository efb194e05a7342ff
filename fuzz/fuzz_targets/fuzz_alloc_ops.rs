#![no_main]
use extalloc::{good_size, ExtAllocError, ExternalAllocator};
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};

#[derive(Debug, Arbitrary)]
enum AllocOp {
    Allocate { size: u32, large: bool },
    Release { index: u16 },
    /// Release with a deliberately wrong size or offset
    BadRelease { index: u16, delta: u32 },
}

// Random allocate/release sequences, including misuse, must never corrupt
// the bookkeeping
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let ops: Vec<AllocOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let mut alloc = ExternalAllocator::new();
    let mut live: Vec<(u64, u64)> = Vec::new();

    for op in ops.iter().take(512) {
        match *op {
            AllocOp::Allocate { size, large } => {
                let size = if large { (size as u64) << 4 } else { size as u64 };
                if size == 0 {
                    assert!(alloc.allocate(0).is_err());
                    continue;
                }
                let offset = alloc
                    .allocate_or_grow(size, |_, _| Ok::<(), ExtAllocError>(()))
                    .unwrap();
                live.push((offset, size));
            }
            AllocOp::Release { index } if !live.is_empty() => {
                let (offset, size) = live.swap_remove(index as usize % live.len());
                alloc.release(offset, size).unwrap();
            }
            AllocOp::BadRelease { index, delta } if !live.is_empty() && delta > 0 => {
                let (offset, size) = live[index as usize % live.len()];
                let before = alloc.allocated_bytes();
                let _ = alloc.release(offset + delta as u64, size);
                if alloc.allocated_bytes() != before {
                    // the wrong offset happened to name another live block
                    let hit = offset + delta as u64;
                    let pos = live.iter().position(|&(o, s)| o == hit && good_size(s) == good_size(size));
                    assert!(pos.is_some(), "release of unknown block changed state");
                    if let Some(pos) = pos {
                        live.swap_remove(pos);
                    }
                }
            }
            _ => {}
        }
    }

    let expected: u64 = live.iter().map(|&(_, size)| good_size(size)).sum();
    assert_eq!(alloc.allocated_bytes(), expected);
    for &(offset, _) in &live {
        assert!(alloc.is_allocated(offset));
    }
});
