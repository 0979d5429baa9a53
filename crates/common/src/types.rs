use std::fmt;
use std::str::FromStr;

// === Channel Mode ===

/// Per-channel pixel encoding. The discriminant is the byte stored in shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ChanMode {
    #[serde(rename = "UC8")]
    Uc8 = 0,
    #[serde(rename = "H16")]
    H16 = 1,
    #[serde(rename = "F32")]
    F32 = 2,
}

impl ChanMode {
    pub const ALL: [ChanMode; 3] = [ChanMode::Uc8, ChanMode::H16, ChanMode::F32];

    /// Bytes per channel.
    pub const fn byte_size(self) -> usize {
        match self {
            ChanMode::Uc8 => 1,
            ChanMode::H16 => 2,
            ChanMode::F32 => 4,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ChanMode::Uc8),
            1 => Some(ChanMode::H16),
            2 => Some(ChanMode::F32),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChanMode::Uc8 => "UC8",
            ChanMode::H16 => "H16",
            ChanMode::F32 => "F32",
        }
    }
}

impl fmt::Display for ChanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UC8" => Ok(ChanMode::Uc8),
            "H16" => Ok(ChanMode::H16),
            "F32" => Ok(ChanMode::F32),
            other => Err(format!("unknown chanMode: {other}")),
        }
    }
}

// === Topology ===

/// Shape of a frame buffer. Any field change requires a new data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topology {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub mode: ChanMode,
    /// Row 0 is the top scanline when set, the bottom one otherwise.
    pub top_to_bottom: bool,
}

impl Topology {
    pub fn new(width: u32, height: u32, channels: u32, mode: ChanMode, top_to_bottom: bool) -> Self {
        Self {
            width,
            height,
            channels,
            mode,
            top_to_bottom,
        }
    }

    /// Same dimensions, different pixel layout.
    pub fn with_layout(self, channels: u32, mode: ChanMode, top_to_bottom: bool) -> Self {
        Self {
            channels,
            mode,
            top_to_bottom,
            ..self
        }
    }

    pub fn pixel_size(&self) -> usize {
        self.channels as usize * self.mode.byte_size()
    }

    pub fn scanline_size(&self) -> usize {
        self.pixel_size() * self.width as usize
    }

    /// Size of the raw pixel payload in bytes.
    pub fn data_size(&self) -> usize {
        self.scanline_size() * self.height as usize
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} chan:{} {} top2btm:{}",
            self.width,
            self.height,
            self.channels,
            self.mode,
            if self.top_to_bottom { "on" } else { "off" }
        )
    }
}

// === Segment listing backend ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListerKind {
    /// Native enumeration where the host has one, `ipcs` otherwise.
    #[default]
    Auto,
    /// `/proc/sysvipc/shm` (Linux only).
    Proc,
    /// Parse `ipcs` output with the platform's column layout.
    Ipcs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chan_mode() {
        assert_eq!(ChanMode::Uc8.byte_size(), 1);
        assert_eq!(ChanMode::H16.byte_size(), 2);
        assert_eq!(ChanMode::F32.byte_size(), 4);
        assert_eq!(ChanMode::from_u8(1), Some(ChanMode::H16));
        assert_eq!(ChanMode::from_u8(3), None);
        assert_eq!("F32".parse::<ChanMode>().unwrap(), ChanMode::F32);
        assert!("f32".parse::<ChanMode>().is_err());
        assert_eq!(ChanMode::Uc8.to_string(), "UC8");
    }

    #[test]
    fn test_topology_sizes() {
        let topo = Topology::new(640, 480, 3, ChanMode::H16, true);
        assert_eq!(topo.pixel_size(), 6);
        assert_eq!(topo.scanline_size(), 3840);
        assert_eq!(topo.data_size(), 640 * 480 * 6);

        let other = topo.with_layout(4, ChanMode::F32, false);
        assert_eq!(other.width, 640);
        assert_eq!(other.data_size(), 640 * 480 * 16);
        assert_ne!(topo, other);
    }

    #[test]
    fn test_chan_mode_serde_names() {
        #[derive(serde::Deserialize)]
        struct Wrap {
            mode: ChanMode,
            lister: ListerKind,
        }
        let w: Wrap = toml::from_str("mode = \"H16\"\nlister = \"proc\"").unwrap();
        assert_eq!(w.mode, ChanMode::H16);
        assert_eq!(w.lister, ListerKind::Proc);
    }
}
