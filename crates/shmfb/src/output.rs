//! Frame publisher: owns the control segment and the current frame buffer segment.
//!
//! States: no control segment yet, control segment without a frame buffer, and
//! publishing. A topology change allocates a new frame buffer, points the control
//! block at it and sweeps the old one once its last reader detaches.

use std::sync::Arc;

use tracing::{info, warn};

use common::config::AppConfig;
use common::types::{ChanMode, Topology};

use crate::control::ControlHandle;
use crate::convert;
use crate::error::{Result, ShmError};
use crate::frame::{FrameBuffer, FrameBufferHandle};
use crate::gc;
use crate::listing::{lister_for, SegmentLister};
use crate::sink::{MessageSink, StderrSink};

pub struct Publisher {
    active: bool,
    ctrl: Option<ControlHandle>,
    fb: Option<FrameBufferHandle>,
    scratch: Vec<u8>,
    lister: Box<dyn SegmentLister>,
    sink: Box<dyn MessageSink>,
    pub(crate) verify_max_errors: usize,
}

impl Publisher {
    /// Starts inactive: nothing is created or swept on the host until
    /// `set_active(true)` or a config with `publisher.active` switches it on.
    pub fn new(lister: Box<dyn SegmentLister>) -> Self {
        Self {
            active: false,
            ctrl: None,
            fb: None,
            scratch: Vec::new(),
            lister,
            sink: Box::new(StderrSink),
            verify_max_errors: 32,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut publisher = Self::new(lister_for(config.sweep.lister));
        publisher.active = config.publisher.active;
        publisher.verify_max_errors = config.publisher.verify_max_errors;
        publisher
    }

    pub fn with_sink(mut self, sink: Box<dyn MessageSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn ctrl_id(&self) -> Option<i32> {
        self.ctrl.as_ref().map(|c| c.id())
    }

    pub fn fb_id(&self) -> Option<i32> {
        self.fb.as_ref().map(|f| f.id())
    }

    pub fn current_fb(&self) -> Option<Arc<FrameBuffer>> {
        self.fb.as_ref().map(|f| f.fb())
    }

    pub(crate) fn message(&self, msg: &str) {
        self.sink.send(msg);
    }

    /// Sweep orphaned segments of every known layout.
    pub fn reclaim_unused(&self) -> usize {
        gc::reclaim_all(self.lister.as_ref(), self.sink.as_ref())
    }

    fn deactivate(&mut self, what: &str, e: &ShmError) {
        warn!("{what}: {e}");
        self.message(&format!("ERROR : {what} ({e}), publisher deactivated"));
        self.active = false;
    }

    /// Make sure the control segment and a frame buffer of `topology` exist.
    /// Returns `false` (after deactivating) when a segment could not be created.
    fn ensure_segments(&mut self, topology: Topology) -> bool {
        if self.ctrl.is_none() {
            self.reclaim_unused();
            match ControlHandle::create() {
                Ok(ctrl) => self.ctrl = Some(ctrl),
                Err(e) => {
                    self.deactivate("could not create control segment", &e);
                    return false;
                }
            }
        }

        if self.fb.as_ref().is_some_and(|fb| fb.topology() == topology) {
            return true;
        }

        let fb = match FrameBufferHandle::create(topology) {
            Ok(fb) => fb,
            Err(e) => {
                self.deactivate("could not create frame buffer", &e);
                return false;
            }
        };
        let shm_id = fb.id();
        if let Some(ctrl) = &self.ctrl {
            ctrl.set_current_shm_id(shm_id);
        }
        // detaches the previous buffer; it is swept below unless a reader still holds it
        self.fb = Some(fb);
        self.reclaim_unused();

        info!(shm_id, %topology, "published new frame buffer");
        self.message(&format!("Changed current shmFb to new one (shmId:{shm_id})"));
        true
    }

    /// Publish one frame whose bytes already match `topology`. Returns whether the
    /// frame was written; an inactive publisher does nothing.
    pub fn publish(&mut self, topology: Topology, data: &[u8]) -> bool {
        if !self.active || !self.ensure_segments(topology) {
            return false;
        }
        let expected = FrameBuffer::calc_pixel_data_size(&topology);
        if data.len() < expected {
            let e = ShmError::PayloadSize {
                topology,
                expected,
                actual: data.len(),
            };
            warn!("{e}");
            self.message(&format!("ERROR : {e}"));
            return false;
        }
        match &self.fb {
            Some(fb) => {
                fb.fb().write_pixel_data(&data[..expected]);
                true
            }
            None => false,
        }
    }

    /// Publish `data` laid out as `src`, converted to the given channel count, mode
    /// and scan direction. Identical layouts go straight to `publish`.
    pub fn publish_converted(
        &mut self,
        src: Topology,
        data: &[u8],
        channels: u32,
        mode: ChanMode,
        top_to_bottom: bool,
    ) -> bool {
        let dst = src.with_layout(channels, mode, top_to_bottom);
        if dst == src {
            return self.publish(src, data);
        }
        if !self.active {
            return false;
        }

        let mut scratch = std::mem::take(&mut self.scratch);
        let published = match convert::convert_into(&src, data, &dst, &mut scratch) {
            Ok(()) => self.publish(dst, &scratch),
            Err(e) => {
                warn!("{e}");
                self.message(&format!("ERROR : {e}"));
                false
            }
        };
        self.scratch = scratch;
        published
    }

    /// Three UC8 channels, top row first.
    pub fn publish_rgb888(&mut self, width: u32, height: u32, data: &[u8]) -> bool {
        self.publish(Topology::new(width, height, 3, ChanMode::Uc8, true), data)
    }

    pub fn show_shm_id(&self) -> String {
        let id = |v: Option<i32>| v.map_or_else(|| "empty".to_string(), |id| id.to_string());
        format!(
            "shmId info {{\n  shmFbCtrl:{}\n  current shmFb:{}\n}}",
            id(self.ctrl_id()),
            id(self.fb_id())
        )
    }

    /// Remove this publisher's own segments. Readers keep their mappings until they detach.
    pub fn remove_segments(&mut self) -> Result<()> {
        if let Some(mut fb) = self.fb.take() {
            fb.remove()?;
        }
        if let Some(mut ctrl) = self.ctrl.take() {
            ctrl.remove()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::testing::FixedLister;
    use crate::sink::testing::Recorder;

    fn publisher() -> (Publisher, FixedLister, Recorder) {
        let lister = FixedLister::default();
        let sink = Recorder::default();
        let mut publisher = Publisher::new(Box::new(lister.clone())).with_sink(Box::new(sink.clone()));
        publisher.set_active(true);
        (publisher, lister, sink)
    }

    fn frame(topology: &Topology, seed: u8) -> Vec<u8> {
        (0..topology.data_size())
            .map(|i| (i as u8).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn test_new_starts_inactive() {
        let p = Publisher::new(Box::new(FixedLister::default()));
        assert!(!p.is_active());

        let mut config = AppConfig::default();
        assert!(Publisher::from_config(&config).is_active());
        config.publisher.active = false;
        assert!(!Publisher::from_config(&config).is_active());
    }

    #[test]
    fn test_inactive_is_noop() {
        let (mut p, _, sink) = publisher();
        p.set_active(false);
        let topo = Topology::new(4, 4, 3, ChanMode::Uc8, true);
        assert!(!p.publish(topo, &frame(&topo, 0)));
        assert!(!p.publish_converted(topo, &frame(&topo, 0), 4, ChanMode::F32, false));
        assert_eq!(p.ctrl_id(), None);
        assert_eq!(p.fb_id(), None);
        assert!(sink.lines().is_empty());
        assert!(p.show_shm_id().contains("shmFbCtrl:empty"));
    }

    #[test]
    fn test_publish_creates_ctrl_and_fb() {
        let (mut p, _, sink) = publisher();
        let topo = Topology::new(16, 8, 3, ChanMode::Uc8, true);
        let data = frame(&topo, 3);
        assert!(p.publish(topo, &data));

        let ctrl_id = p.ctrl_id().unwrap();
        let fb_id = p.fb_id().unwrap();
        let reader = ControlHandle::attach(ctrl_id).unwrap();
        assert_eq!(reader.current_shm_id(), fb_id);

        let fb = FrameBufferHandle::attach(reader.current_shm_id()).unwrap();
        assert_eq!(fb.topology(), topo);
        assert_eq!(fb.fb().pixel_data(), data);
        assert!(sink.contains(&format!("Changed current shmFb to new one (shmId:{fb_id})")));

        // same topology reuses the buffer
        let next = frame(&topo, 9);
        assert!(p.publish(topo, &next));
        assert_eq!(p.fb_id(), Some(fb_id));
        assert_eq!(fb.fb().pixel_data(), next);

        let text = p.show_shm_id();
        assert!(text.contains(&format!("shmFbCtrl:{ctrl_id}")));
        assert!(text.contains(&format!("current shmFb:{fb_id}")));

        drop(fb);
        drop(reader);
        p.remove_segments().unwrap();
    }

    #[test]
    fn test_topology_change_swaps_buffer() {
        let (mut p, lister, sink) = publisher();
        let hd = Topology::new(1920, 1080, 3, ChanMode::Uc8, true);
        assert!(p.publish(hd, &frame(&hd, 0)));
        let old_id = p.fb_id().unwrap();
        lister.push_info(crate::listing::SegmentInfo {
            shm_id: old_id,
            size: FrameBuffer::calc_data_size(&hd),
            perms: crate::segment::SHM_PERMS,
            n_attach: None,
        });

        // a consumer keeps the old buffer alive through the swap
        let old_reader = FrameBufferHandle::attach(old_id).unwrap();

        let small = Topology::new(1280, 720, 3, ChanMode::Uc8, true);
        assert!(p.publish(small, &frame(&small, 1)));
        let new_id = p.fb_id().unwrap();
        assert_ne!(new_id, old_id);

        let ctrl = ControlHandle::attach(p.ctrl_id().unwrap()).unwrap();
        assert_eq!(ctrl.current_shm_id(), new_id);
        assert_eq!(old_reader.topology(), hd);
        assert!(FrameBufferHandle::attach(old_id).is_ok());

        drop(old_reader);
        assert_eq!(p.reclaim_unused(), 1);
        assert!(FrameBufferHandle::attach(old_id).is_err());
        assert!(sink.contains(&format!("shmId:{old_id}")));

        drop(ctrl);
        p.remove_segments().unwrap();
    }

    #[test]
    fn test_converted_identical_layout_matches_publish() {
        let topo = Topology::new(32, 16, 4, ChanMode::H16, false);
        let data = frame(&topo, 5);

        let (mut direct, _, _) = publisher();
        assert!(direct.publish(topo, &data));
        let (mut converted, _, _) = publisher();
        assert!(converted.publish_converted(topo, &data, 4, ChanMode::H16, false));

        let a = direct.current_fb().unwrap().pixel_data();
        let b = converted.current_fb().unwrap().pixel_data();
        assert_eq!(a, b);
        assert_eq!(a, data);

        direct.remove_segments().unwrap();
        converted.remove_segments().unwrap();
    }

    #[test]
    fn test_converted_layout() {
        let (mut p, _, _) = publisher();
        let src = Topology::new(2, 2, 1, ChanMode::Uc8, false);
        assert!(p.publish_converted(src, &[0, 255, 255, 0], 2, ChanMode::F32, true));

        let fb = p.current_fb().unwrap();
        assert_eq!(fb.topology(), src.with_layout(2, ChanMode::F32, true));
        // logical rows survive the flip
        assert_eq!(fb.pixel_f32(0, 0), vec![0.0, 0.0]);
        assert_eq!(fb.pixel_f32(1, 0), vec![1.0, 0.0]);
        assert_eq!(fb.pixel_f32(0, 1), vec![1.0, 0.0]);
        assert_eq!(fb.pixel_f32(1, 1), vec![0.0, 0.0]);

        p.remove_segments().unwrap();
    }

    #[test]
    fn test_short_payload_reported() {
        let (mut p, _, sink) = publisher();
        let topo = Topology::new(8, 8, 3, ChanMode::Uc8, true);
        assert!(!p.publish(topo, &[0u8; 10]));
        assert!(p.is_active());
        assert!(sink.contains("pixel payload too small"));
        p.remove_segments().unwrap();
    }

    #[test]
    fn test_oversized_topology_deactivates() {
        let (mut p, _, sink) = publisher();
        let huge = Topology::new(1 << 20, 1 << 20, 4, ChanMode::F32, true);
        assert!(!p.publish(huge, &[]));
        assert!(!p.is_active());
        assert!(p.fb_id().is_none());
        assert!(sink.contains("publisher deactivated"));

        // stays off
        let topo = Topology::new(2, 2, 1, ChanMode::Uc8, true);
        assert!(!p.publish(topo, &[0; 4]));
        assert!(p.fb_id().is_none());
        p.remove_segments().unwrap();
    }

    #[test]
    fn test_publish_rgb888() {
        let (mut p, _, _) = publisher();
        let data = vec![7u8; 4 * 2 * 3];
        assert!(p.publish_rgb888(4, 2, &data));
        let fb = p.current_fb().unwrap();
        assert_eq!(fb.topology(), Topology::new(4, 2, 3, ChanMode::Uc8, true));
        p.remove_segments().unwrap();
    }
}
