//! Control block: a tiny segment naming the frame buffer consumers should read.
//!
//! ```text
//!    0  headMessage   [u8; 64]  "ShmFbCtrl <time>\0"
//!   64  totalSize     u64
//!   72  currentShmId  u32       0 until the first frame buffer is published
//! ```

use tracing::{debug, info};

use crate::error::{Result, ShmError};
use crate::frame::{header_time, indent};
use crate::segment::Segment;
use crate::view::{HeaderKey, ShmView, HEADER_SIZE};

const OFFSET_HEAD_MESSAGE: usize = 0;
const SIZE_HEAD_MESSAGE: usize = HEADER_SIZE;
const OFFSET_TOTAL_SIZE: usize = OFFSET_HEAD_MESSAGE + SIZE_HEAD_MESSAGE;
const OFFSET_CURRENT_SHM_ID: usize = OFFSET_TOTAL_SIZE + 8;
const DATA_SIZE: usize = OFFSET_CURRENT_SHM_ID + 4;

const _: () = assert!(DATA_SIZE == 76);

pub struct ControlBlock {
    view: ShmView,
}

impl ControlBlock {
    pub fn new(view: ShmView, initialize: bool) -> Result<Self> {
        if view.len() != DATA_SIZE {
            return Err(ShmError::LayoutMismatch {
                layout: "ShmFbCtrl",
                expected: DATA_SIZE,
                actual: view.len(),
            });
        }
        let ctrl = Self { view };
        if initialize {
            let msg = format!("{}{}", HeaderKey::FbCtrl.signature(), header_time());
            ctrl.view
                .write_message(OFFSET_HEAD_MESSAGE, SIZE_HEAD_MESSAGE, &msg);
            ctrl.view.write_u64(OFFSET_TOTAL_SIZE, DATA_SIZE as u64);
            ctrl.set_current_shm_id(0);
        }
        Ok(ctrl)
    }

    pub const fn calc_data_size() -> usize {
        DATA_SIZE
    }

    pub fn retrieve_total_size(view: &ShmView) -> u64 {
        view.read_u64(OFFSET_TOTAL_SIZE)
    }

    pub fn head_message(&self) -> String {
        self.view.read_message(OFFSET_HEAD_MESSAGE, SIZE_HEAD_MESSAGE)
    }

    pub fn total_size(&self) -> u64 {
        Self::retrieve_total_size(&self.view)
    }

    /// Id of the frame buffer segment currently published, 0 when none yet.
    pub fn current_shm_id(&self) -> i32 {
        self.view.read_u32(OFFSET_CURRENT_SHM_ID) as i32
    }

    pub fn set_current_shm_id(&self, shm_id: i32) {
        self.view.write_u32(OFFSET_CURRENT_SHM_ID, shm_id as u32);
    }

    pub fn view(&self) -> &ShmView {
        &self.view
    }

    pub fn show_offsets() -> String {
        format!(
            "ShmFbCtrl offset {{\n  headMessage:{OFFSET_HEAD_MESSAGE}\n  totalSize:{OFFSET_TOTAL_SIZE}\n  currentShmId:{OFFSET_CURRENT_SHM_ID}\n  dataSize:{DATA_SIZE}\n}}"
        )
    }

    pub fn show(&self) -> String {
        format!(
            "ShmFbCtrl {{\n  headMessage:{}\n  totalSize:{}\n  currentShmId:{}\n}}",
            self.head_message(),
            self.total_size(),
            self.current_shm_id()
        )
    }
}

pub struct ControlHandle {
    segment: Segment,
    ctrl: ControlBlock,
}

impl ControlHandle {
    pub fn create() -> Result<Self> {
        let mut segment = Segment::create(DATA_SIZE)?;
        let ctrl = match segment
            .attached_view()
            .and_then(|view| ControlBlock::new(view, true))
        {
            Ok(ctrl) => ctrl,
            Err(e) => {
                let _ = segment.remove();
                return Err(e);
            }
        };
        info!(shm_id = segment.id(), "created control segment");
        Ok(Self { segment, ctrl })
    }

    pub fn attach(shm_id: i32) -> Result<Self> {
        let segment = Segment::attach(shm_id, DATA_SIZE)?;
        let view = segment.attached_view()?;

        let stored = ControlBlock::retrieve_total_size(&view) as usize;
        if stored != segment.size() {
            return Err(ShmError::SizeMismatch {
                shm_id,
                what: "stored totalSize vs segment size",
                expected: segment.size(),
                actual: stored,
            });
        }

        let ctrl = ControlBlock::new(view, false)?;
        debug!(shm_id, current = ctrl.current_shm_id(), "attached control segment");
        Ok(Self { segment, ctrl })
    }

    pub fn id(&self) -> i32 {
        self.segment.id()
    }

    pub fn ctrl(&self) -> &ControlBlock {
        &self.ctrl
    }

    pub fn current_shm_id(&self) -> i32 {
        self.ctrl.current_shm_id()
    }

    pub fn set_current_shm_id(&self, shm_id: i32) {
        self.ctrl.set_current_shm_id(shm_id);
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn detach(&mut self) -> Result<()> {
        self.segment.detach()
    }

    pub fn remove(&mut self) -> Result<()> {
        self.segment.remove()
    }

    pub fn show(&self) -> String {
        format!(
            "ControlHandle {{\n{}\n{}\n}}",
            indent(&self.segment.show()),
            indent(&self.ctrl.show())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctrl_layout() {
        assert_eq!(ControlBlock::calc_data_size(), 76);
        let ctrl = ControlBlock::new(ShmView::local(76), true).unwrap();
        assert!(ctrl.head_message().starts_with("ShmFbCtrl "));
        assert_eq!(ctrl.total_size(), 76);
        assert_eq!(ctrl.current_shm_id(), 0);

        ctrl.set_current_shm_id(1234);
        assert_eq!(ctrl.view().read_u32(72), 1234);
        assert!(ctrl.show().contains("currentShmId:1234"));
        assert!(ControlBlock::show_offsets().contains("currentShmId:72"));
    }

    #[test]
    fn test_ctrl_size_must_match() {
        for len in [0, 75, 77, 4096] {
            let err = ControlBlock::new(ShmView::local(len), true).err().unwrap();
            assert!(matches!(err, ShmError::LayoutMismatch { expected: 76, .. }));
        }
    }

    #[test]
    fn test_ctrl_handle_create_and_attach() {
        let mut owner = ControlHandle::create().unwrap();
        assert_eq!(owner.current_shm_id(), 0);
        owner.set_current_shm_id(77);

        {
            let reader = ControlHandle::attach(owner.id()).unwrap();
            assert_eq!(reader.current_shm_id(), 77);
            assert_eq!(reader.ctrl().head_message(), owner.ctrl().head_message());
            assert!(reader.show().contains("ShmFbCtrl"));
        }

        owner.ctrl().view().write_u64(64, 99);
        let err = ControlHandle::attach(owner.id()).err().unwrap();
        assert!(matches!(err, ShmError::SizeMismatch { actual: 99, .. }));

        owner.remove().unwrap();
    }

    #[test]
    fn test_hex_dump_of_ctrl_clamps_to_segment() {
        let mut owner = ControlHandle::create().unwrap();
        assert_eq!(Segment::peek(owner.id(), 256).unwrap().len(), 76);

        let dump = Segment::hex_dump(owner.id(), 256).unwrap();
        assert!(dump.contains("size:76 {"), "{dump}");
        assert!(dump.contains("|ShmFbCtrl "));
        assert!(dump.contains("00000040: "));
        assert!(!dump.contains("00000050: "));
        owner.remove().unwrap();
    }
}
