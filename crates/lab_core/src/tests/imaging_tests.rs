use super::*;

use std::{
    env, fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3];
const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 9, 9];

fn meta(tag: &str, concentration: f64) -> ImageMeta {
    ImageMeta {
        solution_type: Some(tag.to_string()),
        concentration: Some(concentration),
        rgb: Some([120.0, 80.0, 40.0]),
        timestamp: Some("2024-05-01T10:05:00Z".into()),
        cycle: Some(1),
        test_id: None,
    }
}

#[test]
fn raw_without_metadata_is_dropped() {
    let mut images = ImageCorrelator::default();
    assert!(matches!(
        images.accept_raw(PNG),
        Err(ProtocolError::UncorrelatedImage(_))
    ));
    assert!(images.all_results().next().is_none());
}

#[test]
fn raw_uses_the_most_recent_metadata_once() {
    let mut images = ImageCorrelator::default();
    images.accept_meta(meta("al", 10.0));
    images.accept_meta(meta("al", 12.5));

    let result = images.accept_raw(PNG).expect("correlated");
    assert_eq!(result.solution_type, SolutionType::Al);
    assert_eq!(result.concentration, Some(12.5));
    assert_eq!(result.image.mime, "image/png");
    assert!(result.image.data_uri.starts_with("data:image/png;base64,"));

    assert!(images.accept_raw(PNG).is_err(), "slot already consumed");
    assert_eq!(images.results(SolutionType::Al).len(), 1);
}

#[test]
fn interleaved_tags_pair_with_their_own_metadata() {
    let mut images = ImageCorrelator::default();
    images.accept_meta(meta("al", 10.0));
    images.accept_raw(PNG).expect("al image");
    images.accept_meta(meta("silicon", 6.0));
    images.accept_raw(JPEG).expect("si image");

    assert_eq!(images.latest(SolutionType::Si).map(|r| r.image.mime), Some("image/jpeg"));
    let summary = images.summary();
    assert!(summary.has_results);
    assert!((summary.dissolution_index - (1.54 * 10.0 + 6.0)).abs() < 1e-9);
    assert!((summary.si_al_ratio - 0.6).abs() < 1e-9);
}

#[test]
fn unknown_tag_clears_the_pointer() {
    let mut images = ImageCorrelator::default();
    images.accept_meta(meta("al", 10.0));
    assert_eq!(images.accept_meta(meta("fe", 1.0)), None);
    assert!(images.accept_raw(PNG).is_err());
}

#[test]
fn result_converts_to_backend_sample() {
    let mut images = ImageCorrelator::default();
    images.accept_meta(meta("si", 3.0));
    let sample = images.accept_raw(PNG).expect("image").to_sample();
    assert_eq!(sample.solution_type, SolutionType::Si);
    assert_eq!(sample.cycle, Some(1));
    assert!(sample
        .source_image
        .as_deref()
        .is_some_and(|uri| uri.starts_with("data:image/png")));
}

struct CountingHandle {
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl CaptureHandle for CountingHandle {
    async fn grab_frame(&mut self) -> Result<CapturedFrame> {
        Ok(CapturedFrame {
            mime: "image/png".into(),
            bytes: PNG.to_vec(),
        })
    }

    fn release(self: Box<Self>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn repeat_trigger_keeps_handle_and_updates_cycle() {
    let released = Arc::new(AtomicUsize::new(0));
    let mut sessions = CaptureSessions::default();
    let run = RunId::from(8);

    assert!(sessions.open(run.clone(), Some(1), Utc::now()));
    let mut session = sessions.take(&run).expect("open");
    session.attach(Box::new(CountingHandle {
        released: released.clone(),
    }));
    sessions.restore(session);

    assert!(!sessions.open(run.clone(), Some(2), Utc::now()));
    assert_eq!(sessions.cycle(&run), Some(Some(2)));
    assert_eq!(released.load(Ordering::SeqCst), 0);

    assert!(sessions.cancel(&run));
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(!sessions.is_open(&run));
    assert!(!sessions.cancel(&run));
}

#[test]
fn restore_yields_to_a_newer_session() {
    let released = Arc::new(AtomicUsize::new(0));
    let mut sessions = CaptureSessions::default();
    let run = RunId::from(8);
    sessions.open(run.clone(), Some(1), Utc::now());
    let mut stale = sessions.take(&run).expect("open");
    stale.attach(Box::new(CountingHandle {
        released: released.clone(),
    }));

    sessions.open(run.clone(), Some(2), Utc::now());
    sessions.restore(stale);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(sessions.cycle(&run), Some(Some(2)));
}

#[tokio::test]
async fn file_device_serves_frames_from_disk() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("lab_dashboard_frame_{suffix}.jpg"));
    fs::write(&path, JPEG).expect("write frame");

    let device = FileCaptureDevice::new(&path);
    let mut handle = device.acquire().await.expect("acquire");
    let frame = handle.grab_frame().await.expect("frame");
    assert_eq!(frame.mime, "image/jpeg");
    assert_eq!(frame.bytes, JPEG);
    handle.release();

    fs::remove_file(&path).expect("cleanup");
    assert!(device.acquire().await.is_err());
}
