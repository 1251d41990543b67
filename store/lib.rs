// This file is part of Camwatch, a single-camera motion-triggered video recorder.
// Copyright (C) 2024 The Camwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The event-record store: a single `rusqlite` table of [`Record`]s plus the artifacts
//! (`*_video.mp4`, `*_thumb.jpg`, `*_vthumb.mp4`) they reference on disk.
//!
//! Mutations flow through one owning task (`Handle` is the cheaply-clonable façade in front of
//! it), so the sqlite connection is never touched from more than one place at a time. Every
//! mutation persists before the store's change-broadcast fires, per the "all transitions persist
//! before notifying listeners" lifecycle rule.

pub mod detections;
pub mod gc;

use base::{err, Error, ErrorKind};
use detections::Detections;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn, Instrument as _};

/// One persisted event record. Carries only its own fields — no back-pointer to the store — so
/// it stays trivially `Clone` for listener fan-out (see `SPEC_FULL.md` §9, "Cyclic references").
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub identifier: String,
    pub triggered_at: SystemTime,
    pub have_video: bool,
    pub have_thumb: bool,
    pub have_vthumb: bool,
    pub video_duration_sec: f64,
    pub size_bytes: u64,
    pub classification: Detections,
}

impl Record {
    pub fn have_classification(&self) -> bool {
        !self.classification.is_empty()
    }

    pub fn video_path(&self, base_dir: &Path) -> PathBuf {
        video_path(base_dir, &self.identifier)
    }

    pub fn thumb_path(&self, base_dir: &Path) -> PathBuf {
        thumb_path(base_dir, &self.identifier)
    }

    pub fn vthumb_path(&self, base_dir: &Path) -> PathBuf {
        vthumb_path(base_dir, &self.identifier)
    }
}

pub fn video_path(base_dir: &Path, identifier: &str) -> PathBuf {
    base_dir.join(format!("{identifier}_video.mp4"))
}

pub fn thumb_path(base_dir: &Path, identifier: &str) -> PathBuf {
    base_dir.join(format!("{identifier}_thumb.jpg"))
}

pub fn vthumb_path(base_dir: &Path, identifier: &str) -> PathBuf {
    base_dir.join(format!("{identifier}_vthumb.mp4"))
}

/// Appends the `.temp` suffix used for in-flight artifact writes.
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut s = final_path.as_os_str().to_owned();
    s.push(".temp");
    PathBuf::from(s)
}

#[derive(Default)]
pub struct ListFilter {
    pub have_classification: bool,
}

enum Command {
    NewRecord {
        triggered_at: SystemTime,
        resp: oneshot::Sender<Result<Record, Error>>,
    },
    Get {
        identifier: String,
        resp: oneshot::Sender<Result<Option<Record>, Error>>,
    },
    List {
        filter: ListFilter,
        resp: oneshot::Sender<Result<Vec<Record>, Error>>,
    },
    VideoClosed {
        identifier: String,
        duration_sec: f64,
        size_bytes: u64,
        detections: Detections,
    },
    ThumbClosed {
        identifier: String,
        size_bytes: u64,
    },
    VthumbClosed {
        identifier: String,
        size_bytes: u64,
    },
    SetDetections {
        identifier: String,
        detections: Detections,
    },
    Delete {
        identifier: String,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    Gc {
        max_size_bytes: u64,
        max_age: Option<Duration>,
        resp: oneshot::Sender<Result<usize, Error>>,
    },
}

/// Cheaply-clonable handle to the store's owning task.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::Sender<Command>,
    updates: broadcast::Sender<()>,
    base_dir: PathBuf,
}

impl Handle {
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Subscribes to the store's change-notification broadcast: one `()` per mutation (or,
    /// during a GC sweep, exactly one at the end — see [`gc`]).
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.updates.subscribe()
    }

    async fn call<T>(
        &self,
        f: impl FnOnce(oneshot::Sender<Result<T, Error>>) -> Command,
    ) -> Result<T, Error> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(f(resp_tx))
            .await
            .map_err(|_| err!(Internal, msg("store task is gone")))?;
        resp_rx
            .await
            .map_err(|_| err!(Internal, msg("store task dropped response")))?
    }

    pub async fn new_record(&self, triggered_at: SystemTime) -> Result<Record, Error> {
        self.call(|resp| Command::NewRecord { triggered_at, resp })
            .await
    }

    pub async fn get(&self, identifier: &str) -> Result<Option<Record>, Error> {
        self.call(|resp| Command::Get {
            identifier: identifier.to_owned(),
            resp,
        })
        .await
    }

    pub async fn list(&self, filter: ListFilter) -> Result<Vec<Record>, Error> {
        self.call(|resp| Command::List { filter, resp }).await
    }

    pub async fn video_closed(
        &self,
        identifier: &str,
        duration_sec: f64,
        size_bytes: u64,
        detections: Detections,
    ) -> Result<(), Error> {
        self.send(Command::VideoClosed {
            identifier: identifier.to_owned(),
            duration_sec,
            size_bytes,
            detections,
        })
        .await
    }

    pub async fn thumb_closed(&self, identifier: &str, size_bytes: u64) -> Result<(), Error> {
        self.send(Command::ThumbClosed {
            identifier: identifier.to_owned(),
            size_bytes,
        })
        .await
    }

    pub async fn vthumb_closed(&self, identifier: &str, size_bytes: u64) -> Result<(), Error> {
        self.send(Command::VthumbClosed {
            identifier: identifier.to_owned(),
            size_bytes,
        })
        .await
    }

    pub async fn set_detections(
        &self,
        identifier: &str,
        detections: Detections,
    ) -> Result<(), Error> {
        self.send(Command::SetDetections {
            identifier: identifier.to_owned(),
            detections,
        })
        .await
    }

    pub async fn delete(&self, identifier: &str) -> Result<(), Error> {
        self.call(|resp| Command::Delete {
            identifier: identifier.to_owned(),
            resp,
        })
        .await
    }

    /// Runs one GC sweep now; returns the number of records deleted. See [`gc::select_for_deletion`]
    /// for the pure selection law this wraps.
    pub async fn gc_now(
        &self,
        max_size_bytes: u64,
        max_age: Option<Duration>,
    ) -> Result<usize, Error> {
        self.call(|resp| Command::Gc {
            max_size_bytes,
            max_age,
            resp,
        })
        .await
    }

    async fn send(&self, cmd: Command) -> Result<(), Error> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| err!(Internal, msg("store task is gone")))
    }
}

struct Actor {
    conn: Connection,
    base_dir: PathBuf,
    updates: broadcast::Sender<()>,
}

/// Opens (creating if absent) the sqlite database at `db_path` and spawns the owning task.
///
/// `base_dir` is the artifact directory; it must already exist.
pub fn open(db_path: &Path, base_dir: PathBuf) -> Result<Handle, Error> {
    let conn = Connection::open(db_path)
        .map_err(|e| err!(BindError, msg("opening {}: {e}", db_path.display())))?;
    init_schema(&conn)?;

    let (tx, rx) = mpsc::channel(32);
    let (updates, _) = broadcast::channel(16);
    let handle = Handle {
        tx,
        updates: updates.clone(),
        base_dir: base_dir.clone(),
    };
    let mut actor = Actor {
        conn,
        base_dir,
        updates,
    };
    let span = tracing::info_span!("store");
    tokio::task::Builder::new()
        .name("store")
        .spawn(async move { actor.run(rx).await }.instrument(span))
        .expect("can't spawn store task");
    Ok(handle)
}

fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            identifier         TEXT PRIMARY KEY,
            triggered_at_unix  INTEGER NOT NULL,
            have_video         INTEGER NOT NULL DEFAULT 0,
            have_thumb         INTEGER NOT NULL DEFAULT 0,
            have_vthumb        INTEGER NOT NULL DEFAULT 0,
            video_duration_sec REAL NOT NULL DEFAULT 0,
            size_bytes         INTEGER NOT NULL DEFAULT 0,
            classification     TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS records_triggered_at ON records (triggered_at_unix);
        "#,
    )
    .map_err(|e| err!(Internal, msg("initializing schema: {e}")))?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<Record> {
    let unix: i64 = row.get("triggered_at_unix")?;
    let classification_json: String = row.get("classification")?;
    let classification = Detections::from_json(&classification_json).unwrap_or_default();
    Ok(Record {
        identifier: row.get("identifier")?,
        triggered_at: SystemTime::UNIX_EPOCH + Duration::from_secs(unix.max(0) as u64),
        have_video: row.get::<_, i64>("have_video")? != 0,
        have_thumb: row.get::<_, i64>("have_thumb")? != 0,
        have_vthumb: row.get::<_, i64>("have_vthumb")? != 0,
        video_duration_sec: row.get("video_duration_sec")?,
        size_bytes: row.get::<_, i64>("size_bytes")?.max(0) as u64,
        classification,
    })
}

impl Actor {
    #[instrument(skip_all)]
    async fn run(&mut self, mut rx: mpsc::Receiver<Command>) {
        info!("starting");
        while let Some(cmd) = rx.recv().await {
            if let Err(e) = self.handle(cmd) {
                error!(err = %e.chain(), "store command failed");
            }
        }
        info!("ending");
    }

    fn notify(&self) {
        // No receivers is fine; nobody's listening right now.
        let _ = self.updates.send(());
    }

    fn handle(&mut self, cmd: Command) -> Result<(), Error> {
        match cmd {
            Command::NewRecord { triggered_at, resp } => {
                let r = self.new_record(triggered_at);
                if r.is_ok() {
                    self.notify();
                }
                let _ = resp.send(r);
            }
            Command::Get { identifier, resp } => {
                let _ = resp.send(self.get(&identifier));
            }
            Command::List { filter, resp } => {
                let _ = resp.send(self.list(&filter));
            }
            Command::VideoClosed {
                identifier,
                duration_sec,
                size_bytes,
                detections,
            } => {
                self.conn
                    .execute(
                        "UPDATE records SET have_video = 1, video_duration_sec = ?1, \
                         size_bytes = size_bytes + ?2, classification = ?3 WHERE identifier = ?4",
                        params![
                            duration_sec,
                            size_bytes as i64,
                            merge_classification(&mut self.conn, &identifier, &detections)?,
                            identifier,
                        ],
                    )
                    .map_err(|e| err!(Internal, msg("video_closed {identifier}: {e}")))?;
                self.notify();
            }
            Command::ThumbClosed {
                identifier,
                size_bytes,
            } => {
                self.conn
                    .execute(
                        "UPDATE records SET have_thumb = 1, size_bytes = size_bytes + ?1 \
                         WHERE identifier = ?2",
                        params![size_bytes as i64, identifier],
                    )
                    .map_err(|e| err!(Internal, msg("thumb_closed {identifier}: {e}")))?;
                self.notify();
            }
            Command::VthumbClosed {
                identifier,
                size_bytes,
            } => {
                self.conn
                    .execute(
                        "UPDATE records SET have_vthumb = 1, size_bytes = size_bytes + ?1 \
                         WHERE identifier = ?2",
                        params![size_bytes as i64, identifier],
                    )
                    .map_err(|e| err!(Internal, msg("vthumb_closed {identifier}: {e}")))?;
                self.notify();
            }
            Command::SetDetections {
                identifier,
                detections,
            } => {
                let merged = merge_classification(&mut self.conn, &identifier, &detections)?;
                self.conn
                    .execute(
                        "UPDATE records SET classification = ?1 WHERE identifier = ?2",
                        params![merged, identifier],
                    )
                    .map_err(|e| err!(Internal, msg("set_detections {identifier}: {e}")))?;
                self.notify();
            }
            Command::Delete { identifier, resp } => {
                let r = self.delete_one(&identifier);
                if r.is_ok() {
                    self.notify();
                }
                let _ = resp.send(r);
            }
            Command::Gc {
                max_size_bytes,
                max_age,
                resp,
            } => {
                let r = self.gc(max_size_bytes, max_age);
                if matches!(&r, Ok(n) if *n > 0) {
                    self.notify();
                }
                let _ = resp.send(r);
            }
        }
        Ok(())
    }

    fn new_record(&mut self, triggered_at: SystemTime) -> Result<Record, Error> {
        let identifier = base::time::format_identifier(triggered_at);
        let unix = triggered_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.conn
            .execute(
                "INSERT INTO records (identifier, triggered_at_unix) VALUES (?1, ?2)",
                params![identifier, unix],
            )
            .map_err(|e| err!(AlreadyExists, msg("creating record {identifier}: {e}")))?;
        debug!(%identifier, "created record");
        Ok(Record {
            identifier,
            triggered_at,
            have_video: false,
            have_thumb: false,
            have_vthumb: false,
            video_duration_sec: 0.0,
            size_bytes: 0,
            classification: Detections::default(),
        })
    }

    fn get(&self, identifier: &str) -> Result<Option<Record>, Error> {
        self.conn
            .query_row(
                "SELECT * FROM records WHERE identifier = ?1",
                params![identifier],
                row_to_record,
            )
            .optional()
            .map_err(|e| err!(Internal, msg("get {identifier}: {e}")))
    }

    fn list(&self, filter: &ListFilter) -> Result<Vec<Record>, Error> {
        let sql = if filter.have_classification {
            "SELECT * FROM records WHERE classification != '[]' ORDER BY triggered_at_unix DESC"
        } else {
            "SELECT * FROM records ORDER BY triggered_at_unix DESC"
        };
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| err!(Internal, msg("preparing list query: {e}")))?;
        let rows = stmt
            .query_map([], row_to_record)
            .map_err(|e| err!(Internal, msg("listing records: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| err!(Internal, msg("listing records: {e}")))
    }

    fn delete_one(&mut self, identifier: &str) -> Result<(), Error> {
        for p in [
            video_path(&self.base_dir, identifier),
            thumb_path(&self.base_dir, identifier),
            vthumb_path(&self.base_dir, identifier),
        ] {
            if let Err(e) = std::fs::remove_file(&p) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %p.display(), %e, "failed to remove artifact");
                }
            }
        }
        let n = self
            .conn
            .execute("DELETE FROM records WHERE identifier = ?1", params![identifier])
            .map_err(|e| err!(Internal, msg("deleting {identifier}: {e}")))?;
        if n == 0 {
            return Err(err!(NotFound, msg("no such record {identifier}")));
        }
        Ok(())
    }

    /// Runs the garbage collector: see [`gc::select_for_deletion`] for the selection law.
    fn gc(&mut self, max_size_bytes: u64, max_age: Option<Duration>) -> Result<usize, Error> {
        let records = self.list(&ListFilter::default())?;
        let now = SystemTime::now();
        let doomed = gc::select_for_deletion(&records, max_size_bytes, max_age, now);
        for identifier in &doomed {
            self.delete_one(identifier)?;
        }
        if !doomed.is_empty() {
            info!(count = doomed.len(), "GC deleted records");
        }
        Ok(doomed.len())
    }
}

/// Merges `new` into the stored classification for `identifier` and returns the serialized,
/// merged JSON blob, without yet writing it back (the caller's `UPDATE` does that).
fn merge_classification(
    conn: &mut Connection,
    identifier: &str,
    new: &Detections,
) -> Result<String, Error> {
    let existing: String = conn
        .query_row(
            "SELECT classification FROM records WHERE identifier = ?1",
            params![identifier],
            |r| r.get(0),
        )
        .map_err(|e| err!(NotFound, msg("no such record {identifier}: {e}")))?;
    let mut merged = Detections::from_json(&existing).unwrap_or_default();
    merged.merge(new);
    Ok(merged.to_json())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, Handle) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("camwatch.sqlite");
        let handle = open(&db_path, dir.path().to_owned()).unwrap();
        (dir, handle)
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let (_dir, h) = open_temp().await;
        let t = SystemTime::now();
        let r = h.new_record(t).await.unwrap();
        let got = h.get(&r.identifier).await.unwrap().unwrap();
        assert_eq!(got.identifier, r.identifier);
        assert!(!got.have_video);
        assert!(!got.have_classification());
    }

    #[tokio::test]
    async fn monotonic_have_flags_and_classification_merge() {
        let (_dir, h) = open_temp().await;
        let r = h.new_record(SystemTime::now()).await.unwrap();
        h.video_closed(&r.identifier, 4.2, 1000, Detections::single("person", 0.7))
            .await
            .unwrap();
        h.set_detections(&r.identifier, Detections::single("person", 0.95))
            .await
            .unwrap();
        h.thumb_closed(&r.identifier, 10).await.unwrap();

        let got = h.get(&r.identifier).await.unwrap().unwrap();
        assert!(got.have_video);
        assert!(got.have_thumb);
        assert!(!got.have_vthumb);
        assert_eq!(got.size_bytes, 1010);
        // classification merge keeps the max confidence.
        assert_eq!(got.classification.top(), Some(("person".to_owned(), 0.95)));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let (_dir, h) = open_temp().await;
        let e = h.delete("20260101-000000+0000").await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_newest_first() {
        let (_dir, h) = open_temp().await;
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let r1 = h.new_record(t0).await.unwrap();
        let r2 = h.new_record(t0 + Duration::from_secs(60)).await.unwrap();
        let all = h.list(ListFilter::default()).await.unwrap();
        assert_eq!(all[0].identifier, r2.identifier);
        assert_eq!(all[1].identifier, r1.identifier);
    }
}
