//! The publisher's two runtime options as plain text commands:
//!
//! - `active [on|off|show]` toggles or reports the active flag
//! - `shmId` reports the control and current frame buffer segment ids

use crate::output::Publisher;

impl Publisher {
    /// Run one command line. `Err` carries a usage message.
    pub fn handle_command(&mut self, line: &str) -> Result<String, String> {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("active"), arg, None) => {
                match arg.unwrap_or("show") {
                    "on" => self.set_active(true),
                    "off" => self.set_active(false),
                    "show" => {}
                    other => return Err(format!("active: unknown argument {other:?} (on|off|show)")),
                }
                Ok(format!("active {}", self.is_active()))
            }
            (Some("shmId"), None, _) => Ok(self.show_shm_id()),
            (Some(cmd), ..) => Err(format!("unknown command {cmd:?} (active <on|off|show> | shmId)")),
            (None, ..) => Err("empty command".to_string()),
        }
    }
}
