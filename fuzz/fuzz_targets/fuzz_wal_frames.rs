#![no_main]
use libfuzzer_sys::fuzz_target;
use libfuzzer_sys::arbitrary::Arbitrary;
use mirage_vfs::{OpenOptions, Registry};

#[derive(Debug, Arbitrary)]
enum WalOp {
    Header,
    FrameHeader { frame: u8, page_number: u8, commit: bool },
    Payload { frame: u8, offset: u8, byte: u8, len: u8 },
    Sync,
    Extract { since: u8 },
    Checkpoint,
    BeginWrite,
    EndWrite,
}

const PAGE_SIZE: u64 = 512;
const FRAME_SIZE: u64 = 24 + PAGE_SIZE;

// WAL write patterns in any order, interleaved with extraction and
// checkpoints, must never panic or corrupt the gate.
fuzz_target!(|ops: Vec<WalOp>| {
    let registry = Registry::new();
    let db = match registry.open("fuzz.db", OpenOptions::create()) {
        Ok(f) => f,
        Err(_) => return,
    };
    let wal = match registry.open("fuzz.db-wal", OpenOptions::create()) {
        Ok(f) => f,
        Err(_) => return,
    };

    let mut header = [0u8; 32];
    header[0..4].copy_from_slice(&0x377f0682u32.to_be_bytes());
    header[8..12].copy_from_slice(&(PAGE_SIZE as u32).to_be_bytes());

    let mut in_flight = 0u32;
    for op in ops.iter().take(64) {
        match op {
            WalOp::Header => {
                let _ = wal.write_at(0, &header);
            }
            WalOp::FrameHeader {
                frame,
                page_number,
                commit,
            } => {
                let mut fh = [0u8; 24];
                fh[0..4].copy_from_slice(&(*page_number as u32).to_be_bytes());
                fh[4..8].copy_from_slice(&(*commit as u32).to_be_bytes());
                let _ = wal.write_at(32 + (*frame as u64 % 8) * FRAME_SIZE, &fh);
            }
            WalOp::Payload {
                frame,
                offset,
                byte,
                len,
            } => {
                let data = vec![*byte; 1 + *len as usize % PAGE_SIZE as usize];
                let offset = (*offset as u64) % PAGE_SIZE;
                let _ = wal.write_at(
                    32 + (*frame as u64 % 8) * FRAME_SIZE + 24 + offset,
                    &data,
                );
            }
            WalOp::Sync => {
                let _ = wal.sync();
            }
            WalOp::Extract { since } => {
                if let Ok(frames) = db.committed_frames(*since as u64) {
                    for frame in &frames {
                        assert_eq!(frame.data.len(), PAGE_SIZE as usize);
                    }
                }
            }
            WalOp::Checkpoint => {
                let res = db.checkpoint();
                if in_flight > 0 {
                    assert!(res.is_err());
                }
            }
            WalOp::BeginWrite => {
                if db.begin_write().is_ok() {
                    in_flight += 1;
                }
            }
            WalOp::EndWrite => {
                if in_flight > 0 {
                    let _ = db.end_write();
                    in_flight -= 1;
                }
            }
        }
    }
});
