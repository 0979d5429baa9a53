//! Sweep of orphaned managed segments.
//!
//! A managed segment is one created by this crate (perms 0644) whose header starts
//! with a known signature. It is orphaned when nobody but the sweeper is attached.

use std::fmt;

use tracing::{debug, info, warn};

use crate::control::ControlBlock;
use crate::frame::FrameBuffer;
use crate::listing::{SegmentInfo, SegmentLister};
use crate::segment::{Segment, SHM_PERMS};
use crate::sink::MessageSink;
use crate::view::{HeaderKey, HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    NoneFound,
    AllInUse { found: usize },
    Cleaned { removed: usize, in_use: usize },
}

impl SweepOutcome {
    pub fn removed(&self) -> usize {
        match self {
            SweepOutcome::Cleaned { removed, .. } => *removed,
            _ => 0,
        }
    }
}

impl fmt::Display for SweepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepOutcome::NoneFound => f.write_str("no managed segments found"),
            SweepOutcome::AllInUse { found } => write!(f, "all {found} managed segments in use"),
            SweepOutcome::Cleaned { removed, in_use } => {
                write!(f, "cleaned {removed} segments ({in_use} still in use)")
            }
        }
    }
}

/// Smallest segment that can hold the layout behind `key`.
pub fn min_size_for(key: HeaderKey) -> usize {
    match key {
        HeaderKey::Fb => FrameBuffer::calc_min_data_size(),
        HeaderKey::FbCtrl => ControlBlock::calc_data_size(),
    }
}

fn is_candidate(info: &SegmentInfo, min_header_size: usize) -> bool {
    info.size >= min_header_size && info.perms == SHM_PERMS
}

/// Attach to a listed segment; `None` (after reporting) when it vanished or is not ours.
fn open_candidate(info: &SegmentInfo, min_header_size: usize, sink: &dyn MessageSink) -> Option<Segment> {
    match Segment::attach(info.shm_id, min_header_size) {
        Ok(segment) => Some(segment),
        Err(e) => {
            warn!(shm_id = info.shm_id, "sweep skipped segment: {e}");
            sink.send(&format!("WARNING : sweep skipped shmId:{} ({e})", info.shm_id));
            None
        }
    }
}

fn list_or_empty(lister: &dyn SegmentLister, sink: &dyn MessageSink) -> Vec<SegmentInfo> {
    match lister.list() {
        Ok(rows) => rows,
        Err(e) => {
            warn!(lister = lister.name(), "segment listing failed: {e}");
            sink.send(&format!("WARNING : segment listing failed ({e})"));
            Vec::new()
        }
    }
}

/// Remove every segment whose header matches `key` and that has no attachment
/// besides the sweeper's own. Per-segment failures are reported and skipped.
pub fn sweep_and_reclaim(
    lister: &dyn SegmentLister,
    min_header_size: usize,
    key: HeaderKey,
    sink: &dyn MessageSink,
) -> SweepOutcome {
    let min_header_size = min_header_size.max(HEADER_SIZE);
    let mut found = 0;
    let mut removed = 0;

    for row in list_or_empty(lister, sink) {
        if !is_candidate(&row, min_header_size) {
            continue;
        }
        let Some(mut segment) = open_candidate(&row, min_header_size, sink) else {
            continue;
        };
        if !segment.is_available(key) {
            continue;
        }
        found += 1;

        let external = segment.n_attach().saturating_sub(1);
        if external > 0 {
            debug!(shm_id = row.shm_id, external, %key, "segment in use");
            continue;
        }

        let shm_id = segment.id();
        match segment.remove() {
            Ok(()) => {
                removed += 1;
                info!(shm_id, %key, "removed unused segment");
                sink.send(&format!("Removed unused {key} (shmId:{shm_id})"));
            }
            Err(e) => {
                warn!(shm_id, "sweep could not remove segment: {e}");
                sink.send(&format!("WARNING : could not remove shmId:{shm_id} ({e})"));
            }
        }
    }

    match (found, removed) {
        (0, _) => SweepOutcome::NoneFound,
        (found, 0) => SweepOutcome::AllInUse { found },
        (found, removed) => SweepOutcome::Cleaned {
            removed,
            in_use: found - removed,
        },
    }
}

/// Sweep every known layout. Returns the number of removed segments.
pub fn reclaim_all(lister: &dyn SegmentLister, sink: &dyn MessageSink) -> usize {
    HeaderKey::ALL
        .into_iter()
        .map(|key| sweep_and_reclaim(lister, min_size_for(key), key, sink).removed())
        .sum()
}

/// A segment on the host that carries one of our headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedSegment {
    pub shm_id: i32,
    pub key: HeaderKey,
    pub size: usize,
    /// Attach count excluding the lister's own transient attach.
    pub n_attach: u64,
}

pub fn list_managed(lister: &dyn SegmentLister, sink: &dyn MessageSink) -> Vec<ManagedSegment> {
    let mut out = Vec::new();
    for row in list_or_empty(lister, sink) {
        if !is_candidate(&row, HEADER_SIZE) {
            continue;
        }
        let Some(segment) = open_candidate(&row, HEADER_SIZE, sink) else {
            continue;
        };
        if let Some(key) = segment.header_key() {
            out.push(ManagedSegment {
                shm_id: segment.id(),
                key,
                size: segment.size(),
                n_attach: segment.n_attach().saturating_sub(1),
            });
        }
    }
    out
}

pub fn max_managed_id(segments: &[ManagedSegment]) -> Option<i32> {
    segments.iter().map(|s| s.shm_id).max()
}

pub fn show_all(lister: &dyn SegmentLister, sink: &dyn MessageSink) -> String {
    let segments = list_managed(lister, sink);
    format_list(&segments)
}

pub fn format_list(segments: &[ManagedSegment]) -> String {
    let Some(max_id) = max_managed_id(segments) else {
        return "ShmList is empty".to_string();
    };
    let id_width = max_id.to_string().len();
    let key_width = HeaderKey::MAX_LEN;
    let mut out = String::from("ShmList {\n");
    for s in segments {
        out.push_str(&format!(
            "  shmId:{:>id_width$} {:<key_width$} size:{} nAttach:{}\n",
            s.shm_id,
            s.key.to_string(),
            s.size,
            s.n_attach
        ));
    }
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, ShmError};
    use crate::listing::testing::FixedLister;
    use crate::sink::testing::Recorder;
    use crate::view::ShmView;

    struct BrokenLister;

    impl SegmentLister for BrokenLister {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn list(&self) -> Result<Vec<SegmentInfo>> {
            Err(ShmError::ParseFailed {
                line: "???".into(),
                reason: "test".into(),
            })
        }
    }

    fn info_of(segment: &Segment) -> SegmentInfo {
        SegmentInfo {
            shm_id: segment.id(),
            size: segment.size(),
            perms: SHM_PERMS,
            n_attach: None,
        }
    }

    fn labelled(size: usize, header: &str) -> Segment {
        let segment = Segment::create(size).unwrap();
        let view: ShmView = segment.view().unwrap();
        view.write_message(0, HEADER_SIZE, header);
        segment
    }

    #[test]
    fn test_sweep_removes_only_orphans() {
        let mut orphan = labelled(4096, "ShmFb orphan");
        let busy = labelled(4096, "ShmFb busy");
        let mut foreign = labelled(4096, "NotOurs");
        let mut ctrl = labelled(4096, "ShmFbCtrl other key");

        let lister = FixedLister::of(&[&orphan, &busy, &foreign, &ctrl]);
        let orphan_id = orphan.id();
        orphan.detach().unwrap();
        foreign.detach().unwrap();
        ctrl.detach().unwrap();

        let sink = Recorder::default();
        let outcome = sweep_and_reclaim(&lister, 4096, HeaderKey::Fb, &sink);
        assert_eq!(outcome, SweepOutcome::Cleaned { removed: 1, in_use: 1 });
        assert!(sink.contains(&format!("shmId:{orphan_id}")));
        assert!(Segment::attach(orphan_id, 0).is_err());

        // untouched
        assert!(Segment::attach(busy.id(), 0).is_ok());
        assert!(Segment::attach(foreign.id(), 0).is_ok());
        assert!(Segment::attach(ctrl.id(), 0).is_ok());

        let outcome = sweep_and_reclaim(&lister, 4096, HeaderKey::Fb, &sink);
        assert_eq!(outcome, SweepOutcome::AllInUse { found: 1 });

        let mut busy = busy;
        busy.remove().unwrap();
        foreign.remove().unwrap();
        ctrl.remove().unwrap();
    }

    #[test]
    fn test_sweep_filters_size_and_perms() {
        let mut small = labelled(128, "ShmFb small");
        let mut other_perms = labelled(4096, "ShmFb perms");
        small.detach().unwrap();
        other_perms.detach().unwrap();

        let mut row = info_of(&other_perms);
        row.perms = 0o600;
        let lister = FixedLister::of(&[&small]);
        lister.push_info(row);
        let outcome = sweep_and_reclaim(&lister, 4096, HeaderKey::Fb, &Recorder::default());
        assert_eq!(outcome, SweepOutcome::NoneFound);

        small.remove().unwrap();
        other_perms.remove().unwrap();
    }

    #[test]
    fn test_sweep_survives_vanished_segment() {
        let mut gone = labelled(4096, "ShmFb gone");
        let row = info_of(&gone);
        gone.remove().unwrap();

        let sink = Recorder::default();
        let lister = FixedLister::default();
        lister.push_info(row);
        let outcome = sweep_and_reclaim(&lister, 4096, HeaderKey::Fb, &sink);
        assert_eq!(outcome, SweepOutcome::NoneFound);
        assert!(sink.contains("WARNING"));
    }

    #[test]
    fn test_sweep_warning_carries_os_error() {
        let lister = FixedLister::default();
        lister.push_info(SegmentInfo {
            shm_id: i32::MAX,
            size: 4096,
            perms: SHM_PERMS,
            n_attach: None,
        });
        let sink = Recorder::default();
        let outcome = sweep_and_reclaim(&lister, 4096, HeaderKey::Fb, &sink);
        assert_eq!(outcome, SweepOutcome::NoneFound);
        let expected = std::io::Error::from_raw_os_error(libc::EINVAL).to_string();
        assert!(sink.contains(&format!("shmId:{}", i32::MAX)), "{:?}", sink.lines());
        assert!(sink.contains(&expected), "{:?}", sink.lines());
    }

    #[test]
    fn test_sweep_listing_failure_is_none_found() {
        let sink = Recorder::default();
        let outcome = sweep_and_reclaim(&BrokenLister, 64, HeaderKey::FbCtrl, &sink);
        assert_eq!(outcome, SweepOutcome::NoneFound);
        assert!(sink.contains("segment listing failed"));
        assert_eq!(reclaim_all(&BrokenLister, &sink), 0);
    }

    #[test]
    fn test_list_managed_and_format() {
        let fb = labelled(4096, "ShmFb listed");
        let mut plain = labelled(4096, "plain");
        plain.detach().unwrap();

        let lister = FixedLister::of(&[&fb, &plain]);
        let managed = list_managed(&lister, &Recorder::default());
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].shm_id, fb.id());
        assert_eq!(managed[0].key, HeaderKey::Fb);
        assert_eq!(managed[0].n_attach, 1);
        assert_eq!(max_managed_id(&managed), Some(fb.id()));

        let text = show_all(&lister, &Recorder::default());
        assert!(text.starts_with("ShmList {"));
        assert!(text.contains(&format!("shmId:{} ShmFb", fb.id())));

        assert_eq!(format_list(&[]), "ShmList is empty");

        let mut fb = fb;
        fb.remove().unwrap();
        plain.remove().unwrap();
    }

    #[test]
    fn test_min_size_for() {
        assert_eq!(min_size_for(HeaderKey::Fb), 4096);
        assert_eq!(min_size_for(HeaderKey::FbCtrl), 76);
    }
}
