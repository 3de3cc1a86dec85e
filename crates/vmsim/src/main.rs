use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use log::LevelFilter;
use uvm::{ProgramImage, VmConfig};
use vmsim::{Console, Script, run_demo, run_script};

#[derive(Parser)]
#[command(name = "vmsim")]
#[command(about = "Demand-paged user address spaces on a simulated machine")]
struct Args {
    #[command(flatten)]
    machine: Machine,

    /// Log more detail; repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs)]
struct Machine {
    /// Bytes per page and per frame
    #[arg(long, default_value_t = VmConfig::default().page_size, global = true)]
    page_size: usize,

    /// Frames of main memory
    #[arg(long, default_value_t = VmConfig::default().num_frames, global = true)]
    frames: usize,

    /// Bytes reserved for each process's user stack
    #[arg(long, default_value_t = VmConfig::default().user_stack_size, global = true)]
    stack_size: usize,
}

impl Machine {
    fn config(&self) -> VmConfig {
        VmConfig {
            page_size: self.page_size,
            num_frames: self.frames,
            user_stack_size: self.stack_size,
            ..VmConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Print the header of a NOFF executable and the space it would need
    Inspect {
        /// NOFF executable
        image: PathBuf,
    },
    /// Run a script against a process started from a NOFF executable
    Run {
        /// NOFF executable for the first process
        image: PathBuf,

        /// Script of loads, stores and system calls
        script: PathBuf,
    },
    /// Run the built-in shared memory and fork scenario
    Demo,
}

fn load_image(path: &Path) -> Result<Arc<ProgramImage>, Box<dyn std::error::Error>> {
    let bytes = fs::read(path)?;
    Ok(Arc::new(ProgramImage::load(Box::new(bytes))?))
}

fn inspect(config: VmConfig, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    let image = load_image(path)?;
    let header = image.header();

    println!("{}", path.display());
    for (name, segment) in [
        ("code", header.code),
        ("data", header.init_data),
        ("bss", header.uninit_data),
    ] {
        println!(
            "  {name:<5} vaddr {:#08x}  offset {:#08x}  size {:#x}",
            segment.virtual_addr, segment.file_offset, segment.size
        );
    }

    let size = header.image_size()? + config.user_stack_size;
    let pages = size.div_ceil(config.page_size);
    println!(
        "  {pages} pages of {} bytes, stack pointer starts at {:#x}",
        config.page_size,
        pages * config.page_size - config.stack_slack
    );
    Ok(())
}

fn print(transcript: &[String]) {
    for line in transcript {
        println!("{line}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    Console::init(level)?;

    let config = args.machine.config();
    match args.command {
        Command::Inspect { image } => inspect(config, &image),
        Command::Run { image, script } => {
            let script = Script::parse(&fs::read_to_string(script)?)?;
            print(&run_script(config, load_image(&image)?, &script)?);
            Ok(())
        }
        Command::Demo => {
            print(&run_demo(config)?);
            Ok(())
        }
    }
}
