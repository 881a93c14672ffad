#![no_main]
use libfuzzer_sys::fuzz_target;
use libfuzzer_sys::arbitrary::Arbitrary;
use mirage_vfs::{OpenOptions, Registry};

#[derive(Debug, Arbitrary)]
enum FileOp {
    Write { offset: u16, data: Vec<u8> },
    Read { offset: u16, len: u16 },
    Truncate { size: u16 },
    Sync,
}

// Arbitrary byte-level op sequences against a journal-style file must never
// panic, and reads must never report more bytes than the file holds.
fuzz_target!(|ops: Vec<FileOp>| {
    let registry = Registry::new();
    let file = match registry.open("fuzz.db-journal", OpenOptions::create()) {
        Ok(f) => f,
        Err(_) => return,
    };

    for op in ops.iter().take(64) {
        match op {
            FileOp::Write { offset, data } => {
                let _ = file.write_at(*offset as u64, data);
            }
            FileOp::Read { offset, len } => {
                let mut buf = vec![0u8; (*len as usize).min(4096)];
                if let Ok(n) = file.read_at(*offset as u64, &mut buf) {
                    let size = file.size().unwrap_or(0);
                    assert!(n <= buf.len());
                    assert!(n == 0 || *offset as u64 + n as u64 <= size);
                }
            }
            FileOp::Truncate { size } => {
                let _ = file.truncate(*size as u64);
            }
            FileOp::Sync => {
                let _ = file.sync();
            }
        }
    }
});
