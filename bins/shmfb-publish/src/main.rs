//! shmfb-publish: demo producer.
//! Publishes test-pattern frames, converting to the configured output layout and
//! swapping width/height every `resize_every` frames.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::config::AppConfig;
use common::types::Topology;
use shmfb::{FrameBuffer, Publisher};

/// One source frame with the test pattern baked in.
fn render(topology: Topology, pattern: u32) -> Result<Vec<u8>> {
    let fb = FrameBuffer::local(topology)?;
    fb.fill_test_pattern(pattern);
    Ok(fb.pixel_data())
}

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/shmfb.toml".to_string());
    let config = AppConfig::load_or_default(Path::new(&config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .init();

    let demo = &config.demo;
    let mut publisher = Publisher::from_config(&config);
    if !publisher.is_active() {
        warn!("publisher.active is off in {config_path}, nothing to do");
        return Ok(());
    }
    let mut src = demo.source_topology();
    let mut frame = render(src, demo.pattern)?;

    info!(%src, out = %demo.output_topology(), frames = demo.frames, "publishing");

    for n in 0..demo.frames {
        if demo.resize_every > 0 && n > 0 && n % demo.resize_every == 0 {
            src = Topology {
                width: src.height,
                height: src.width,
                ..src
            };
            frame = render(src, demo.pattern)?;
            info!(%src, frame = n, "topology change");
        }

        let ok = publisher.publish_converted(
            src,
            &frame,
            demo.out_channels,
            demo.out_mode,
            demo.out_top_to_bottom,
        );
        if !ok && !publisher.is_active() {
            bail!("publisher deactivated at frame {n}");
        }

        if n == 0 {
            info!("{}", publisher.show_shm_id());
        }
        std::thread::sleep(Duration::from_millis(demo.interval_ms));
    }

    info!("{}", publisher.show_shm_id());
    if let Err(e) = publisher.remove_segments() {
        warn!("failed to remove segments: {e}");
    }
    Ok(())
}
