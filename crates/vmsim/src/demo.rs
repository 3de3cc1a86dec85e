//! A parent and child sharing one integer across a fork.
//!
//! The parent stores into a private variable, allocates a shared word and
//! forks. The child writes both; afterwards the parent sees the child's
//! shared write but keeps its own private value.

use std::sync::Arc;

use uvm::{ProgramImage, VmConfig};

use crate::{Driver, ImageBuilder, Kernel, KernelError, Script};

pub const DEMO_SCRIPT: &str = "\
# data is the program's one initialized word
store data 12345
shm a 4
fork child
switch child
store a 10
store data 12178
expect a 10
expect data 12178
exit 0
switch init
expect a 10
expect data 12345
exit 0
";

/// Builds the executable the demo runs: a little code, one initialized
/// word and some uninitialized data.
pub fn demo_image() -> ImageBuilder {
    let code: Vec<u8> = (0..200u8).collect();
    ImageBuilder::new()
        .code(code)
        .data(12345u32.to_le_bytes())
        .bss(64)
}

/// Runs `script` against a fresh kernel with `image` as its first process.
///
/// The first process is bound as `init`; `data` and `bss` name the start of
/// the data segments when they are known. The image is also installed as the
/// file `program`, so scripts can exec it again.
pub fn run_script(
    config: VmConfig,
    image: Arc<ProgramImage>,
    script: &Script,
) -> Result<Vec<String>, KernelError> {
    let mut kernel = Kernel::new(config)?;
    let header = *image.header();
    kernel.install_file("program", Arc::clone(&image));
    let init = kernel.spawn(image)?;

    let mut driver = Driver::new(&mut kernel);
    driver.bind("init", init.as_u32());
    if header.init_data.size > 0 {
        driver.bind("data", header.init_data.virtual_addr as u32);
    }
    if header.uninit_data.size > 0 {
        driver.bind("bss", header.uninit_data.virtual_addr as u32);
    }
    driver.run(script)?;

    let mut transcript = driver.into_transcript();
    let vm = kernel.vm();
    let stats = vm.stats();
    transcript.push(format!(
        "page faults: {}, forks: {}, shared regions: {}, frames in use: {}/{}",
        stats.page_faults,
        stats.forks,
        stats.shared_regions,
        stats.frames_allocated,
        stats.frames_total,
    ));
    vm.verify()?;
    Ok(transcript)
}

/// Runs the built-in demo.
pub fn run_demo(config: VmConfig) -> Result<Vec<String>, KernelError> {
    let script = Script::parse(DEMO_SCRIPT)?;
    run_script(config, demo_image().load()?, &script)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_shares_one_word_and_copies_the_rest() {
        let transcript = run_demo(VmConfig::default()).unwrap();

        assert!(transcript.contains(&"[pid 1] fork -> pid 2".to_string()));
        assert!(transcript.contains(&"[pid 1] expect 0x580 == 10".to_string()));
        assert!(transcript.contains(&"[pid 1] expect 0xc8 == 12345".to_string()));
        assert_eq!(
            transcript.last().map(String::as_str),
            Some("page faults: 1, forks: 1, shared regions: 1, frames in use: 0/32")
        );
    }

    #[test]
    fn demo_fails_cleanly_without_enough_memory() {
        let config = VmConfig {
            num_frames: 2,
            ..VmConfig::default()
        };
        let transcript = run_demo(config);

        assert!(matches!(transcript, Err(KernelError::Script { .. })));
    }
}
