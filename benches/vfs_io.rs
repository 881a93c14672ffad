use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mirage_vfs::{FileHandle, OpenOptions, Registry};

const PAGE_SIZE: usize = 4096;

fn first_page(fill: u8) -> Vec<u8> {
    let mut p = vec![fill; PAGE_SIZE];
    p[..16].copy_from_slice(b"SQLite format 3\0");
    p[16..18].copy_from_slice(&(PAGE_SIZE as u16).to_be_bytes());
    p
}

fn populated_db(pages: usize) -> (Registry, FileHandle) {
    let registry = Registry::new();
    let db = registry.open("bench.db", OpenOptions::create()).unwrap();
    db.write_at(0, &first_page(1)).unwrap();
    for i in 1..pages {
        db.write_at((i * PAGE_SIZE) as u64, &vec![i as u8; PAGE_SIZE])
            .unwrap();
    }
    (registry, db)
}

fn populated_wal(frames: usize) -> (Registry, FileHandle) {
    let (registry, db) = populated_db(1);
    let wal = registry
        .open("bench.db-wal", OpenOptions::create())
        .unwrap();

    let mut header = vec![0u8; 32];
    header[0..4].copy_from_slice(&0x377f0682u32.to_be_bytes());
    header[8..12].copy_from_slice(&(PAGE_SIZE as u32).to_be_bytes());
    wal.write_at(0, &header).unwrap();

    let frame_size = (24 + PAGE_SIZE) as u64;
    for i in 0..frames {
        let offset = 32 + i as u64 * frame_size;
        wal.write_at(offset + 24, &vec![i as u8; PAGE_SIZE]).unwrap();
        let mut fh = vec![0u8; 24];
        fh[0..4].copy_from_slice(&(i as u32 + 1).to_be_bytes());
        fh[4..8].copy_from_slice(&(i as u32 + 1).to_be_bytes());
        wal.write_at(offset, &fh).unwrap();
    }
    wal.sync().unwrap();
    drop(wal);
    (registry, db)
}

fn bench_page_writes(c: &mut Criterion) {
    c.bench_function("write_64_pages", |b| {
        let page = vec![7u8; PAGE_SIZE];
        b.iter(|| {
            let registry = Registry::new();
            let db = registry.open("bench.db", OpenOptions::create()).unwrap();
            db.write_at(0, &first_page(1)).unwrap();
            for i in 1..64 {
                db.write_at((i * PAGE_SIZE) as u64, black_box(&page)).unwrap();
            }
        })
    });
}

fn bench_page_reads(c: &mut Criterion) {
    let (_registry, db) = populated_db(64);
    let mut buf = vec![0u8; PAGE_SIZE];
    c.bench_function("read_64_pages", |b| {
        b.iter(|| {
            for i in 0..64 {
                db.read_at((i * PAGE_SIZE) as u64, black_box(&mut buf)).unwrap();
            }
        })
    });
}

fn bench_frame_extraction(c: &mut Criterion) {
    let (_registry, db) = populated_wal(64);
    c.bench_function("extract_64_frames", |b| {
        b.iter(|| black_box(db.committed_frames(0).unwrap()))
    });
}

fn bench_checkpoint(c: &mut Criterion) {
    c.bench_function("checkpoint_64_frames", |b| {
        b.iter_with_setup(
            || populated_wal(64),
            |(_registry, db)| {
                black_box(db.checkpoint().unwrap());
            },
        )
    });
}

criterion_group!(
    benches,
    bench_page_writes,
    bench_page_reads,
    bench_frame_extraction,
    bench_checkpoint
);
criterion_main!(benches);
