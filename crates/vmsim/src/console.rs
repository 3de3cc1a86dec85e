//! Log output for the host harness.

use std::io::{self, Write};

use log::LevelFilter;
use spin::{Mutex, Once};

pub struct Console {
    output: Mutex<Option<Box<dyn Write + Send>>>,
}

static DEFAULT: Once<Console> = Once::new();

impl Console {
    /// Installs the console as the global logger, writing to stderr.
    pub fn init(level: LevelFilter) -> Result<&'static Self, log::SetLoggerError> {
        let console = Self::global();
        console.attach(Box::new(io::stderr()));
        console.install(level)?;
        Ok(console)
    }

    pub fn global() -> &'static Self {
        DEFAULT.call_once(|| Console {
            output: Mutex::new(None),
        })
    }

    pub fn install(&'static self, level: LevelFilter) -> Result<(), log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(level);
        Ok(())
    }

    pub fn attach(&self, output: Box<dyn Write + Send>) {
        *self.output.lock() = Some(output);
    }
}

impl log::Log for Console {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Some(output) = &mut *self.output.lock() {
            // Nowhere left to report a failed write.
            let _ = write_log_entry_to(output, record);
        }
    }

    fn flush(&self) {
        if let Some(output) = &mut *self.output.lock() {
            let _ = output.flush();
        }
    }
}

fn write_log_entry_to(writer: &mut impl Write, record: &log::Record) -> io::Result<()> {
    #[cfg(any(debug_assertions, feature = "detailed-logging"))]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
