//! shmfb-tool: inspect, generate and clean up frame buffer segments.
//!
//! Usage: shmfb-tool [--config <path>] <command> [args...]

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::config::AppConfig;
use common::types::{ChanMode, Topology};
use shmfb::gc;
use shmfb::{lister_for, ControlBlock, ControlHandle, FrameBuffer, FrameBufferHandle, Segment, StderrSink};

const USAGE: &str = "\
usage: shmfb-tool [--config <path>] <command>
  list [--json]                              list managed segments
  clear                                      remove managed segments nobody is attached to
  dump <shmId> [size]                        hex dump the start of a segment
  fb-gen <w> <h> <chan> <UC8|H16|F32> [ttb] [pattern]
                                             create a frame buffer filled with a test pattern
  fb-dump <shmId> [pattern]                  show a frame buffer, optionally verify a pattern
  fb-ppm <shmId> <file>                      write a frame buffer as PPM
  ctrl-gen [fbShmId]                         create a control block
  ctrl-dump <shmId>                          show a control block
  current <ctrlShmId>                        show the frame buffer a control block points at
  offsets                                    print both layouts";

#[derive(Serialize)]
struct ListEntry {
    shm_id: i32,
    kind: String,
    size: usize,
    n_attach: u64,
}

fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            if i + 1 >= args.len() {
                bail!("--config needs a path\n{USAGE}");
            }
            let path = args.remove(i + 1);
            args.remove(i);
            path
        }
        None => "config/shmfb.toml".to_string(),
    };
    let config = AppConfig::load_or_default(Path::new(&config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some((cmd, rest)) = args.split_first() else {
        println!("{USAGE}");
        return Ok(());
    };

    match cmd.as_str() {
        "list" => cmd_list(&config, rest.iter().any(|a| a == "--json")),
        "clear" => {
            let removed = gc::reclaim_all(lister_for(config.sweep.lister).as_ref(), &StderrSink);
            println!("removed {removed} unused segments");
            Ok(())
        }
        "dump" => {
            let id = parse_arg::<i32>(rest, 0, "shmId")?;
            let size = opt_arg::<usize>(rest, 1, "size")?.unwrap_or(256);
            println!("{}", Segment::hex_dump(id, size)?);
            Ok(())
        }
        "fb-gen" => cmd_fb_gen(rest),
        "fb-dump" => {
            let handle = FrameBufferHandle::attach(parse_arg(rest, 0, "shmId")?)?;
            println!("{}", handle.show());
            if let Some(pattern) = opt_arg::<u32>(rest, 1, "pattern")? {
                let ok = handle.fb().verify_test_pattern(pattern);
                println!("verifyTestPattern({pattern}): {}", if ok { "OK" } else { "NG" });
            }
            Ok(())
        }
        "fb-ppm" => {
            let handle = FrameBufferHandle::attach(parse_arg(rest, 0, "shmId")?)?;
            let path = rest.get(1).context("missing output file")?;
            let file = File::create(path).with_context(|| format!("failed to create {path}"))?;
            handle
                .fb()
                .write_ppm(BufWriter::new(file))
                .with_context(|| format!("failed to write {path}"))?;
            info!(shm_id = handle.id(), path = %path, "wrote ppm");
            Ok(())
        }
        "ctrl-gen" => {
            let ctrl = ControlHandle::create()?;
            if let Some(fb_id) = opt_arg::<i32>(rest, 0, "fbShmId")? {
                ctrl.set_current_shm_id(fb_id);
            }
            println!("{}", ctrl.show());
            Ok(())
        }
        "ctrl-dump" => {
            let ctrl = ControlHandle::attach(parse_arg(rest, 0, "shmId")?)?;
            println!("{}", ctrl.show());
            Ok(())
        }
        "current" => {
            let ctrl = ControlHandle::attach(parse_arg(rest, 0, "ctrlShmId")?)?;
            let fb_id = ctrl.current_shm_id();
            if fb_id == 0 {
                println!("control block {} has no frame buffer yet", ctrl.id());
                return Ok(());
            }
            let handle = FrameBufferHandle::attach(fb_id)
                .with_context(|| format!("control block points at shmId:{fb_id}, re-read and retry"))?;
            println!("{}", handle.show());
            Ok(())
        }
        "offsets" => {
            println!("{}", FrameBuffer::show_offsets());
            println!("{}", ControlBlock::show_offsets());
            Ok(())
        }
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

fn cmd_list(config: &AppConfig, json: bool) -> Result<()> {
    let segments = gc::list_managed(lister_for(config.sweep.lister).as_ref(), &StderrSink);
    if json {
        let entries: Vec<ListEntry> = segments
            .iter()
            .map(|s| ListEntry {
                shm_id: s.shm_id,
                kind: s.key.to_string(),
                size: s.size,
                n_attach: s.n_attach,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("{}", gc::format_list(&segments));
    }
    Ok(())
}

fn cmd_fb_gen(rest: &[String]) -> Result<()> {
    let width = parse_arg(rest, 0, "width")?;
    let height = parse_arg(rest, 1, "height")?;
    let channels = parse_arg(rest, 2, "channels")?;
    let mode: ChanMode = parse_arg(rest, 3, "chanMode")?;
    let top_to_bottom = opt_arg::<bool>(rest, 4, "ttb")?.unwrap_or(true);
    let pattern = opt_arg::<u32>(rest, 5, "pattern")?.unwrap_or(0);

    let topology = Topology::new(width, height, channels, mode, top_to_bottom);
    let mut handle = FrameBufferHandle::create(topology)?;
    handle.fb().fill_test_pattern(pattern);
    println!("{}", handle.show());
    // the segment outlives this process until swept
    handle.detach()?;
    Ok(())
}

fn parse_arg<T>(args: &[String], index: usize, name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    opt_arg(args, index, name)?.with_context(|| format!("missing <{name}>\n{USAGE}"))
}

fn opt_arg<T>(args: &[String], index: usize, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    args.get(index)
        .map(|s| s.parse::<T>().map_err(|e| anyhow::anyhow!("bad <{name}> {s:?}: {e}")))
        .transpose()
}
