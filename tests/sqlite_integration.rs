//! End-to-end tests driving a real SQLite engine over the registered VFS.
//!
//! A file lives exactly as long as something holds it open, so tests that
//! span connections pin the database with a registry handle, the role the
//! replication layer plays in production.

use mirage_vfs::{register_vfs, unregister_vfs, OpenOptions, Registry};
use rusqlite::{params, Connection, OpenFlags};

// VFS registration is global in SQLite; run these serially.
use std::sync::Mutex as StdMutex;
static VFS_TEST_LOCK: StdMutex<()> = StdMutex::new(());

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn open_rw(db: &str, vfs: &str) -> Connection {
    Connection::open_with_flags(
        format!("file:{}?vfs={}", db, vfs),
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI,
    )
    .unwrap()
}

#[test]
fn test_basic_sql_round_trip() {
    let _lock = VFS_TEST_LOCK.lock();
    init_tracing();

    let registry = Registry::new();
    register_vfs("mirage-basic", registry.clone()).unwrap();

    let pin = registry.open("basic.db", OpenOptions::create()).unwrap();
    {
        let conn = open_rw("basic.db", "mirage-basic");
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO users (name) VALUES (?1)", params!["Alice"])
            .unwrap();
        conn.execute("INSERT INTO users (name) VALUES (?1)", params!["Bob"])
            .unwrap();

        let names: Vec<String> = conn
            .prepare("SELECT name FROM users ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(names, vec!["Alice".to_string(), "Bob".to_string()]);

        conn.execute("UPDATE users SET name = 'Carol' WHERE name = 'Bob'", [])
            .unwrap();
        let carol: i64 = conn
            .query_row("SELECT count(*) FROM users WHERE name = 'Carol'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(carol, 1);
    }

    // Everything stayed in the registry; nothing touched disk.
    assert!(registry.exists("basic.db"));
    assert!(registry.content_stats("basic.db").unwrap().size > 0);

    drop(pin);
    unregister_vfs("mirage-basic").unwrap();
}

#[test]
fn test_wal_mode_and_frame_extraction() {
    let _lock = VFS_TEST_LOCK.lock();
    init_tracing();

    let registry = Registry::new();
    register_vfs("mirage-wal", registry.clone()).unwrap();

    let pin = registry.open("wal.db", OpenOptions::create()).unwrap();
    {
        let conn = open_rw("wal.db", "mirage-wal");
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        // Sync per commit, so frames become visible to replication as soon
        // as each transaction commits.
        conn.execute_batch("PRAGMA synchronous=FULL").unwrap();

        conn.execute("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)", [])
            .unwrap();
        conn.execute("INSERT INTO kv VALUES ('a', '1')", []).unwrap();
        conn.execute("INSERT INTO kv VALUES ('b', '2')", []).unwrap();

        // Committed frames are ready for the replication layer, in order,
        // ending on a commit frame, each one page long.
        let frames = pin.committed_frames(0).unwrap();
        assert!(!frames.is_empty());
        assert!(frames.last().unwrap().commit);
        let page_size = registry.content_stats("wal.db-wal").unwrap().page_size;
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.frame_index, i as u64);
            assert_eq!(Some(frame.data.len()), page_size);
            assert!(frame.page_number >= 1);
        }

        // Extraction is repeatable and resumable.
        let again = pin.committed_frames(0).unwrap();
        assert_eq!(frames.len(), again.len());
        let tail = pin.committed_frames(frames.len() as u64 - 1).unwrap();
        assert_eq!(tail.len(), 1);

        // A second connection shares the same volatile file.
        let conn2 = open_rw("wal.db", "mirage-wal");
        let v: String = conn2
            .query_row("SELECT v FROM kv WHERE k = 'b'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, "2");
        drop(conn2);

        // An engine-driven checkpoint drains the log.
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .unwrap();
        assert!(pin.committed_frames(0).unwrap().is_empty());

        let v: String = conn
            .query_row("SELECT v FROM kv WHERE k = 'a'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, "1");
    }

    drop(pin);
    unregister_vfs("mirage-wal").unwrap();
}

#[test]
fn test_persistence_across_connections_with_pin() {
    let _lock = VFS_TEST_LOCK.lock();
    init_tracing();

    let registry = Registry::new();
    register_vfs("mirage-pin", registry.clone()).unwrap();

    let pin = registry.open("persist.db", OpenOptions::create()).unwrap();
    {
        let conn = open_rw("persist.db", "mirage-pin");
        conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        conn.execute("INSERT INTO t VALUES (41), (1)", []).unwrap();
    }
    {
        let conn = Connection::open_with_flags(
            "file:persist.db?vfs=mirage-pin",
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
        )
        .unwrap();
        let sum: i64 = conn
            .query_row("SELECT sum(x) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sum, 42);
    }

    drop(pin);
    unregister_vfs("mirage-pin").unwrap();
}

#[test]
fn test_unpinned_database_is_volatile() {
    let _lock = VFS_TEST_LOCK.lock();
    init_tracing();

    let registry = Registry::new();
    register_vfs("mirage-volatile", registry.clone()).unwrap();

    {
        let conn = open_rw("gone.db", "mirage-volatile");
        conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
    }
    // The last handle closed; the file no longer exists.
    assert!(!registry.exists("gone.db"));

    // Opening without CREATE therefore fails.
    assert!(Connection::open_with_flags(
        "file:gone.db?vfs=mirage-volatile",
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI,
    )
    .is_err());

    // And a fresh create starts empty.
    let conn = open_rw("gone.db", "mirage-volatile");
    let tables: i64 = conn
        .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))
        .unwrap();
    assert_eq!(tables, 0);
    drop(conn);

    unregister_vfs("mirage-volatile").unwrap();
}

#[test]
fn test_transactions_commit_and_rollback() {
    let _lock = VFS_TEST_LOCK.lock();
    init_tracing();

    let registry = Registry::new();
    register_vfs("mirage-txn", registry.clone()).unwrap();

    let pin = registry.open("txn.db", OpenOptions::create()).unwrap();
    {
        let mut conn = open_rw("txn.db", "mirage-txn");
        conn.execute("CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance REAL)", [])
            .unwrap();
        conn.execute("INSERT INTO accounts (balance) VALUES (100.0)", [])
            .unwrap();

        {
            let tx = conn.transaction().unwrap();
            tx.execute("UPDATE accounts SET balance = balance - 50.0 WHERE id = 1", [])
                .unwrap();
            tx.commit().unwrap();
        }
        {
            let tx = conn.transaction().unwrap();
            tx.execute("UPDATE accounts SET balance = balance - 100.0 WHERE id = 1", [])
                .unwrap();
            // Dropped uncommitted: rolls back.
        }

        let balance: f64 = conn
            .query_row("SELECT balance FROM accounts WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(balance, 50.0);
    }

    drop(pin);
    unregister_vfs("mirage-txn").unwrap();
}

#[test]
fn test_large_blob_spans_many_pages() {
    let _lock = VFS_TEST_LOCK.lock();
    init_tracing();

    let registry = Registry::new();
    register_vfs("mirage-blob", registry.clone()).unwrap();

    let pin = registry.open("blobs.db", OpenOptions::create()).unwrap();
    {
        let conn = open_rw("blobs.db", "mirage-blob");
        conn.execute("CREATE TABLE blobs (id INTEGER PRIMARY KEY, data BLOB)", [])
            .unwrap();

        for i in 0..3i64 {
            let blob = vec![0xAB_u8; 256 * 1024];
            conn.execute("INSERT INTO blobs VALUES (?1, ?2)", params![i, blob])
                .unwrap();
        }
        for i in 0..3i64 {
            let blob: Vec<u8> = conn
                .query_row("SELECT data FROM blobs WHERE id = ?1", params![i], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(blob.len(), 256 * 1024);
            assert!(blob.iter().all(|&b| b == 0xAB));
        }

        // VACUUM exercises the anonymous transient files.
        conn.execute("VACUUM", []).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM blobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    drop(pin);
    unregister_vfs("mirage-blob").unwrap();
}

#[test]
fn test_concurrent_readers() {
    let _lock = VFS_TEST_LOCK.lock();
    init_tracing();

    let registry = Registry::new();
    register_vfs("mirage-readers", registry.clone()).unwrap();

    let pin = registry.open("readers.db", OpenOptions::create()).unwrap();
    {
        let conn = open_rw("readers.db", "mirage-readers");
        conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY, value TEXT)", [])
            .unwrap();
        for i in 0..10i64 {
            conn.execute(
                "INSERT INTO test VALUES (?1, ?2)",
                params![i, format!("value{}", i)],
            )
            .unwrap();
        }
    }

    let handles: Vec<_> = (0..4i64)
        .map(|thread_id| {
            std::thread::spawn(move || {
                let conn = Connection::open_with_flags(
                    "file:readers.db?vfs=mirage-readers",
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
                )
                .unwrap();
                for _ in 0..25 {
                    let count: i64 = conn
                        .query_row("SELECT count(*) FROM test", [], |row| row.get(0))
                        .unwrap();
                    assert_eq!(count, 10);
                    let value: String = conn
                        .query_row(
                            "SELECT value FROM test WHERE id = ?1",
                            params![thread_id % 10],
                            |row| row.get(0),
                        )
                        .unwrap();
                    assert_eq!(value, format!("value{}", thread_id % 10));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    drop(pin);
    unregister_vfs("mirage-readers").unwrap();
}

#[test]
fn test_attached_databases_share_the_vfs() {
    let _lock = VFS_TEST_LOCK.lock();
    init_tracing();

    let registry = Registry::new();
    register_vfs("mirage-attach", registry.clone()).unwrap();

    let pin1 = registry.open("att1.db", OpenOptions::create()).unwrap();
    let pin2 = registry.open("att2.db", OpenOptions::create()).unwrap();
    {
        let conn = open_rw("att1.db", "mirage-attach");
        conn.execute("CREATE TABLE users (id INTEGER, name TEXT)", [])
            .unwrap();
        conn.execute("INSERT INTO users VALUES (1, 'Alice')", [])
            .unwrap();
    }
    {
        let conn = open_rw("att2.db", "mirage-attach");
        conn.execute("CREATE TABLE products (id INTEGER, name TEXT)", [])
            .unwrap();
        conn.execute("INSERT INTO products VALUES (1, 'Widget')", [])
            .unwrap();
    }
    {
        let conn = open_rw("att1.db", "mirage-attach");
        conn.execute("ATTACH DATABASE 'file:att2.db?vfs=mirage-attach' AS db2", [])
            .unwrap();
        let product: String = conn
            .query_row("SELECT name FROM db2.products WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(product, "Widget");
        let user: String = conn
            .query_row("SELECT name FROM users WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(user, "Alice");
    }

    drop(pin1);
    drop(pin2);
    unregister_vfs("mirage-attach").unwrap();
}

#[test]
fn test_independent_registries_under_distinct_names() {
    let _lock = VFS_TEST_LOCK.lock();
    init_tracing();

    let r1 = Registry::new();
    let r2 = Registry::new();
    register_vfs("mirage-iso-a", r1.clone()).unwrap();
    register_vfs("mirage-iso-b", r2.clone()).unwrap();

    let pin1 = r1.open("iso.db", OpenOptions::create()).unwrap();
    let pin2 = r2.open("iso.db", OpenOptions::create()).unwrap();

    {
        let conn = open_rw("iso.db", "mirage-iso-a");
        conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();
        conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
    }
    {
        // Same filename, different namespace: still empty.
        let conn = open_rw("iso.db", "mirage-iso-b");
        let tables: i64 = conn
            .query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tables, 0);
    }

    drop(pin1);
    drop(pin2);
    unregister_vfs("mirage-iso-a").unwrap();
    unregister_vfs("mirage-iso-b").unwrap();
}

#[test]
fn test_double_registration_is_rejected() {
    let _lock = VFS_TEST_LOCK.lock();
    init_tracing();

    let registry = Registry::new();
    register_vfs("mirage-dup", registry.clone()).unwrap();
    assert!(register_vfs("mirage-dup", registry.clone()).is_err());

    unregister_vfs("mirage-dup").unwrap();
    // Unregistering an unknown name is a no-op.
    unregister_vfs("mirage-dup").unwrap();

    // After a clean unregister the name is reusable.
    register_vfs("mirage-dup", registry).unwrap();
    unregister_vfs("mirage-dup").unwrap();
}
