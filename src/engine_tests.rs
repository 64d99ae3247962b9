use super::*;
use crate::config::{InputConfig, InputKind, OutputConfig, StreamConfig, VideoConfig};
use crate::events::BroadcastSink;
use crate::process::probe_usage;
use indexmap::IndexMap;
use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Instant;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::TryRecvError};

const PROGRESS: &str =
    "frame=   10 fps= 30 q=28.0 size=     512kB time=00:00:00.33 bitrate=2450.0kbits/s speed=1x";

/// Prints a banner and a progress line, then exits 0 when it reads `q`.
fn well_behaved() -> String {
    format!(
        "echo 'ffmpeg version test' >&2\n\
         printf '%s\\r' '{PROGRESS}' >&2\n\
         while read -r line; do\n\
           if [ \"$line\" = q ]; then echo 'Exiting normally' >&2; exit 0; fi\n\
         done\n\
         exit 0\n"
    )
}

/// Ignores stdin entirely; only a kill ends it.
const STUBBORN: &str = "echo 'stubborn' >&2\nexec sleep 30\n";

/// Burns CPU and ignores stdin.
const BUSY: &str = "while :; do :; done\n";

const CRASHER: &str = "echo 'boom' >&2\nsleep 0.2\nexit 3\n";

const CLEAN_EXIT: &str = "echo 'done'\nexit 0\n";

/// In-memory config store.
struct MemoryStore {
    streams: Mutex<HashMap<String, StreamConfig>>,
}

impl MemoryStore {
    fn new(configs: Vec<StreamConfig>) -> Self {
        Self {
            streams: Mutex::new(configs.into_iter().map(|c| (c.id.clone(), c)).collect()),
        }
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, id: &str) -> Option<StreamConfig> {
        self.streams.lock().get(id).cloned()
    }

    fn list(&self) -> Vec<StreamConfig> {
        self.streams.lock().values().cloned().collect()
    }
}

struct Harness {
    tmp: TempDir,
    engine: Arc<Engine>,
    events: broadcast::Receiver<StreamEvent>,
}

fn stream(id: &str, enabled: bool) -> StreamConfig {
    StreamConfig {
        id: id.into(),
        name: format!("{id} name"),
        enabled,
        auto_start: true,
        input: InputConfig {
            kind: InputKind::File,
            path: "/media/test clip.ts".into(),
            format: None,
            resolution: None,
            frame_rate: None,
        },
        video: VideoConfig {
            codec: "libx264".into(),
            preset: None,
            tune: None,
            bitrate: "2500k".into(),
            gop_size: 50,
        },
        audio: None,
        output: OutputConfig {
            address: "239.10.0.1".into(),
            port: 5004,
            ttl: 4,
            format: "mpegts".into(),
            packet_size: 1316,
            buffer_size: 65536,
        },
        advanced_options: IndexMap::new(),
    }
}

fn write_script(dir: &Path, body: &str) -> String {
    let path = dir.join("fake-ffmpeg.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn harness_with(script: &str, streams: Vec<StreamConfig>, restart_delay: Duration) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let ffmpeg_binary = write_script(tmp.path(), script);
    let settings = EngineSettings {
        ffmpeg_binary,
        log_dir: tmp.path().join("logs"),
        platform: Platform::Linux,
        grace_period: Duration::from_millis(300),
        restart_delay,
        restart_pause: Duration::from_millis(50),
    };
    let sink = BroadcastSink::new(1024);
    let events = sink.subscribe();
    let engine = Arc::new(Engine::new(
        settings,
        Arc::new(MemoryStore::new(streams)),
        Arc::new(sink),
    ));
    Harness {
        tmp,
        engine,
        events,
    }
}

fn harness(script: &str) -> Harness {
    harness_with(
        script,
        vec![stream("cam1", true)],
        Duration::from_millis(100),
    )
}

async fn next_matching<F>(
    rx: &mut broadcast::Receiver<StreamEvent>,
    timeout: Duration,
    mut pred: F,
) -> Option<StreamEvent>
where
    F: FnMut(&StreamEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn drain(rx: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn start_is_idempotent() {
    let h = harness(&well_behaved());

    let first = h.engine.start("cam1").await.unwrap();
    let second = h.engine.start("cam1").await.unwrap();

    assert!(first.running);
    assert_ne!(first.pid, 0);
    assert_eq!(first.pid, second.pid);
    assert_eq!(first.name, "cam1 name");
    assert_eq!(h.engine.status_all().len(), 1);

    assert!(h.engine.stop("cam1").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn stop_without_handle_is_noop() {
    let mut h = harness(&well_behaved());

    assert!(!h.engine.stop("cam1").await);
    assert!(!h.engine.stop("unknown").await);
    assert!(drain(&mut h.events).is_empty());
    assert!(h.engine.status_all().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn unknown_stream_is_config_not_found() {
    let h = harness(&well_behaved());
    let err = h.engine.start("nope").await.unwrap_err();
    assert!(matches!(err, EngineError::ConfigNotFound(id) if id == "nope"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn spawn_failure_leaves_nothing_registered() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = EngineSettings {
        ffmpeg_binary: tmp.path().join("missing-ffmpeg").to_string_lossy().into_owned(),
        log_dir: tmp.path().join("logs"),
        platform: Platform::Linux,
        grace_period: Duration::from_millis(300),
        restart_delay: Duration::from_millis(100),
        restart_pause: Duration::from_millis(50),
    };
    let engine = Arc::new(Engine::new(
        settings,
        Arc::new(MemoryStore::new(vec![stream("cam1", true)])),
        Arc::new(BroadcastSink::new(8)),
    ));

    let err = engine.start("cam1").await.unwrap_err();
    assert!(matches!(err, EngineError::ProcessStartFailure { .. }));
    assert!(engine.status("cam1").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn graceful_stop_writes_quit_and_footer() {
    let mut h = harness(&well_behaved());
    h.engine.start("cam1").await.unwrap();

    let started = Instant::now();
    assert!(h.engine.stop("cam1").await);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(h.engine.status("cam1").is_none());

    let stopped = next_matching(&mut h.events, Duration::from_secs(1), |e| {
        matches!(e, StreamEvent::Stopped { .. })
    })
    .await;
    assert!(stopped.is_some());

    let messages: Vec<_> = h
        .engine
        .logs("cam1", 100)
        .await
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert!(messages[0].contains("starting"));
    assert!(messages.iter().any(|m| m == "Exiting normally"));
    assert!(messages.iter().any(|m| m == "Process exited with code Some(0)"));
    assert_eq!(messages.last().map(String::as_str), Some("=== Stream stopped ==="));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn stubborn_process_is_killed_after_grace_period() {
    let h = harness(STUBBORN);
    h.engine.start("cam1").await.unwrap();

    let started = Instant::now();
    assert!(h.engine.stop("cam1").await);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    assert!(h.engine.status("cam1").is_none());

    let entries = h.engine.logs("cam1", 100).await;
    assert!(entries
        .iter()
        .any(|e| e.message.contains("Graceful stop timed out")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn restart_gives_a_later_start_time() {
    let h = harness(&well_behaved());
    let before = h.engine.start("cam1").await.unwrap();

    let after = h.engine.restart("cam1").await.unwrap();
    assert!(after.started_at > before.started_at);
    assert_ne!(after.pid, before.pid);
    assert!(after.running);

    assert!(h.engine.stop("cam1").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn progress_line_updates_bitrate_and_publishes_stats() {
    let mut h = harness(&well_behaved());
    h.engine.start("cam1").await.unwrap();

    let stats = next_matching(&mut h.events, Duration::from_secs(3), |e| {
        matches!(e, StreamEvent::Stats { .. })
    })
    .await;
    match stats {
        Some(StreamEvent::Stats { id, stats }) => {
            assert_eq!(id, "cam1");
            assert_eq!(stats.frame(), Some(10));
        }
        other => panic!("expected stats event, got {other:?}"),
    }

    let status = h.engine.status("cam1").unwrap();
    assert_eq!(status.bitrate_kbps, 2450);
    assert!(status.last_updated >= status.started_at);

    assert!(h.engine.stop("cam1").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn logs_return_last_lines_of_the_file() {
    let h = harness(&well_behaved());
    h.engine.start("cam1").await.unwrap();

    // banner + progress line appear after the 3 header lines
    let engine = h.engine.clone();
    let ready = eventually(Duration::from_secs(3), || {
        engine
            .status("cam1")
            .is_some_and(|s| s.bitrate_kbps == 2450)
    })
    .await;
    assert!(ready);

    let entries = h.engine.logs("cam1", 5).await;
    assert_eq!(entries.len(), 5);
    assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let log_dir = h.tmp.path().join("logs");
    let file = std::fs::read_dir(&log_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let content = std::fs::read_to_string(file).unwrap();
    let last: Vec<_> = content.lines().rev().take(5).collect::<Vec<_>>();
    for (entry, line) in entries.iter().zip(last.iter().rev()) {
        assert!(line.ends_with(&entry.message), "{line} / {}", entry.message);
    }
    assert_eq!(entries.last().unwrap().source, "stderr");

    assert!(h.engine.stop("cam1").await);
    // without a handle the most recent file is still readable
    assert!(h.engine.logs("cam1", 5).await.len() <= 5);
    assert!(!h.engine.logs("cam1", 5).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn crash_is_restarted_after_delay() {
    let mut h = harness(CRASHER);
    let first = h.engine.start("cam1").await.unwrap();
    assert!(first.running);

    let exited = next_matching(&mut h.events, Duration::from_secs(3), |e| {
        matches!(e, StreamEvent::Exited { .. })
    })
    .await;
    assert!(matches!(
        exited,
        Some(StreamEvent::Exited { exit_code: Some(3), .. })
    ));

    let restarted = next_matching(&mut h.events, Duration::from_secs(3), |e| {
        matches!(e, StreamEvent::Started(_))
    })
    .await;
    match restarted {
        Some(StreamEvent::Started(status)) => assert_ne!(status.pid, first.pid),
        other => panic!("expected restart, got {other:?}"),
    }

    assert!(h.engine.stop("cam1").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn stop_wins_against_pending_crash_restart() {
    let mut h = harness(CRASHER);
    h.engine.start("cam1").await.unwrap();

    // let it cycle through a few crash/restart rounds
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert!(h.engine.stop("cam1").await);
    drain(&mut h.events);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let late: Vec<_> = drain(&mut h.events)
        .into_iter()
        .filter(|e| matches!(e, StreamEvent::Started(_)))
        .collect();
    assert!(late.is_empty(), "restarted after stop: {late:?}");
    assert!(h.engine.status("cam1").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn crashed_handle_reports_not_running() {
    let h = harness_with(CRASHER, vec![stream("cam1", true)], Duration::from_secs(30));
    h.engine.start("cam1").await.unwrap();

    let engine = h.engine.clone();
    let dead = eventually(Duration::from_secs(3), || {
        engine.status("cam1").is_some_and(|s| !s.running)
    })
    .await;
    assert!(dead);

    let status = h.engine.status("cam1").unwrap();
    assert_eq!(status.pid, 0);
    assert_eq!(status.name, "cam1 name");

    // start on a dead handle clears it and spawns a fresh one
    let fresh = h.engine.start("cam1").await.unwrap();
    assert_ne!(fresh.pid, 0);
    assert!(fresh.started_at > status.started_at);

    assert!(h.engine.stop("cam1").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn clean_exit_is_not_restarted() {
    let mut h = harness(CLEAN_EXIT);
    h.engine.start("cam1").await.unwrap();

    let exited = next_matching(&mut h.events, Duration::from_secs(3), |e| {
        matches!(e, StreamEvent::Exited { .. })
    })
    .await;
    assert!(matches!(
        exited,
        Some(StreamEvent::Exited { exit_code: Some(0), .. })
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.engine.status("cam1").is_none());
    assert!(drain(&mut h.events)
        .iter()
        .all(|e| !matches!(e, StreamEvent::Started(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn disabled_stream_crash_is_not_restarted() {
    let mut h = harness_with(CRASHER, vec![stream("cam1", false)], Duration::from_millis(100));
    h.engine.start("cam1").await.unwrap();

    let exited = next_matching(&mut h.events, Duration::from_secs(3), |e| {
        matches!(e, StreamEvent::Exited { .. })
    })
    .await;
    assert!(exited.is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.engine.status("cam1").is_none());
    assert!(drain(&mut h.events)
        .iter()
        .all(|e| !matches!(e, StreamEvent::Started(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn cpu_percent_starts_at_zero_then_tracks_usage() {
    let h = harness(BUSY);
    let first = h.engine.start("cam1").await.unwrap();
    assert_eq!(first.cpu_percent, 0.0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let second = h.engine.status("cam1").unwrap();
    assert!(second.cpu_percent > 0.0, "{}", second.cpu_percent);
    assert!(second.cpu_percent <= 100.0 * num_cpus::get() as f64);
    assert!(second.memory_bytes > 0);

    assert!(h.engine.stop("cam1").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn autostart_and_stop_all() {
    let h = harness_with(
        &well_behaved(),
        vec![stream("a", true), stream("b", true), stream("off", false)],
        Duration::from_millis(100),
    );

    h.engine.autostart().await;
    let all = h.engine.status_all();
    assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);

    h.engine.stop_all().await;
    assert!(h.engine.status_all().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn start_completes_after_the_caller_goes_away() {
    let mut h = harness(&well_behaved());
    let mut pending = Box::pin(h.engine.start("cam1"));
    let _ = futures::poll!(&mut pending);
    drop(pending);

    let started = next_matching(&mut h.events, Duration::from_secs(3), |e| {
        matches!(e, StreamEvent::Started(_))
    })
    .await;
    let first = match started {
        Some(StreamEvent::Started(status)) => status,
        other => panic!("expected started event, got {other:?}"),
    };
    assert!(probe_usage(first.pid).is_some());

    let again = h.engine.start("cam1").await.unwrap();
    assert!(again.running);
    assert_eq!(again.pid, first.pid);

    assert!(h.engine.stop("cam1").await);
    assert!(h.engine.status("cam1").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn stop_completes_after_the_caller_goes_away() {
    let mut h = harness(STUBBORN);
    h.engine.start("cam1").await.unwrap();

    // grace period is 300 ms, so the caller gives up mid-way
    let gave_up = tokio::time::timeout(Duration::from_millis(100), h.engine.stop("cam1")).await;
    assert!(gave_up.is_err());

    let stopped = next_matching(&mut h.events, Duration::from_secs(3), |e| {
        matches!(e, StreamEvent::Stopped { .. })
    })
    .await;
    assert!(matches!(stopped, Some(StreamEvent::Stopped { id }) if id == "cam1"));
    assert!(h.engine.status("cam1").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn unknown_ids_leave_no_lifecycle_state() {
    let h = harness(&well_behaved());
    for i in 0..200 {
        assert!(!h.engine.stop(&format!("bogus-{i}")).await);
        assert!(matches!(
            h.engine.start(&format!("nope-{i}")).await,
            Err(EngineError::ConfigNotFound(_))
        ));
    }
    assert!(matches!(
        h.engine.restart("gone").await,
        Err(EngineError::ConfigNotFound(_))
    ));
    assert!(h.engine.job_locks.lock().is_empty());

    h.engine.start("cam1").await.unwrap();
    assert!(h.engine.stop("cam1").await);
    assert!(h.engine.job_locks.lock().is_empty());
}
