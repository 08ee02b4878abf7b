//! Memory, logging and service control.

use core::fmt::Write;

use super::{CommandResult, Invocation};
use crate::constants::memory::PAGE_SIZE;
use crate::errors::KernelError;
use crate::logging;
use crate::memory::{frame_allocator, heap};
use crate::services;

pub fn free(inv: &mut Invocation<'_>) -> CommandResult {
    let (free_frames, total_frames) =
        frame_allocator::with_frame_allocator(|frames| (frames.free_frames(), frames.total_frames()));
    let heap = heap::stats();
    let _ = writeln!(
        inv.out,
        "pages: {} free of {} ({} KiB free)",
        free_frames,
        total_frames,
        free_frames * PAGE_SIZE / 1024
    );
    let _ = writeln!(inv.out, "heap: {} bytes free in {} blocks", heap.free_bytes, heap.free_blocks);
    Ok(())
}

/// `loglevel` prints the current level, `loglevel <level>` changes it.
pub fn loglevel(inv: &mut Invocation<'_>) -> CommandResult {
    if let Some(name) = inv.arg(1) {
        let level = logging::parse_level(name).ok_or(KernelError::Invalid)?;
        logging::set_level(level);
    }
    let _ = writeln!(inv.out, "{}", logging::level());
    Ok(())
}

const SYSTEMCTL_USAGE: &str =
    "usage: systemctl start|stop|restart|status|reload|enable|disable <unit>\n       systemctl list-units\n";

pub fn systemctl(inv: &mut Invocation<'_>) -> CommandResult {
    let argv = inv.argv;
    let Some(verb) = argv.get(1).map(|s| s.as_str()) else {
        inv.print(SYSTEMCTL_USAGE);
        return Err(KernelError::Invalid);
    };
    if verb == "list-units" {
        inv.print(&services::list());
        return Ok(());
    }
    let Some(unit) = argv.get(2).map(|s| s.as_str()) else {
        inv.print(SYSTEMCTL_USAGE);
        return Err(KernelError::Invalid);
    };

    let result = match verb {
        "start" => services::start(unit).map(|pid| {
            let _ = writeln!(inv.out, "{}", pid);
        }),
        "stop" => services::stop(unit).map(|()| inv.print("stopped\n")),
        "restart" => services::restart(unit).map(|_| inv.print("ok\n")),
        "reload" => services::reload(unit).map(|()| inv.print("reloaded\n")),
        "enable" => services::set_enabled(unit, true).map(|()| inv.print("enabled\n")),
        "disable" => services::set_enabled(unit, false).map(|()| inv.print("disabled\n")),
        "status" => services::status(unit).map(|text| inv.print(&text)),
        _ => {
            inv.print("unknown subcommand\n");
            return Err(KernelError::Invalid);
        }
    };
    result.inspect_err(|err| {
        let message = match err {
            KernelError::NotFound => "no such service\n",
            _ => "failed\n",
        };
        inv.print(message);
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::run_now;
    use crate::constants::fs::UNIT_DIR;
    use crate::devices::console;
    use crate::errors::KernelError;
    use crate::filesys;
    use crate::memory;
    use crate::sched;
    use crate::services;
    use crate::test_support::{lock_globals, page_pool};
    use alloc::format;

    #[test]
    fn test_free_reports_pool() {
        let _guard = lock_globals();
        memory::init_with_pool(page_pool(256), 256).unwrap();
        let (status, text) = run_now("free", b"");
        assert!(status > 0);
        assert!(text.starts_with("pages: "));
        assert!(text.contains(" free of 256 "));
        assert!(text.contains("heap: "));
    }

    #[test]
    fn test_loglevel_round_trip() {
        let _guard = lock_globals();
        let before = crate::logging::level();
        assert_eq!(run_now("loglevel warn", b"").1, "WARN\n");
        assert_eq!(run_now("loglevel", b"").1, "WARN\n");
        assert!(run_now("loglevel chatty", b"").0 < 0);
        crate::logging::set_level(before);
    }

    #[test]
    fn test_systemctl_verbs() {
        let _guard = lock_globals();
        sched::init();
        console::init();
        filesys::init_with_device(None).unwrap();
        services::init();
        let unit = format!("{}/hello.service", UNIT_DIR);
        filesys::write_file(&unit, b"ExecStart=echo hi > /tmp/hello", false).unwrap();

        let (_, text) = run_now("systemctl start hello", b"");
        let pid: u32 = text.trim().parse().unwrap();
        assert!(sched::exists(pid));
        assert_eq!(run_now("systemctl enable hello", b"").1, "enabled\n");
        assert!(run_now("systemctl list-units", b"").1.contains("hello           running   yes\n"));
        sched::run_until_idle();

        assert_eq!(filesys::read_file("/tmp/hello").unwrap(), b"hi\n");
        assert!(run_now("systemctl status hello", b"").1.contains("Active: inactive"));
        assert_eq!(run_now("systemctl stop hello", b"").1, "stopped\n");
        assert_eq!(run_now("systemctl reload hello", b"").1, "reloaded\n");
        assert_eq!(run_now("systemctl disable hello", b"").1, "disabled\n");

        let (status, text) = run_now("systemctl status ghost", b"");
        assert_eq!(status, KernelError::NotFound.status());
        assert_eq!(text, "no such service\n");
        assert_eq!(run_now("systemctl frob hello", b"").1, "unknown subcommand\n");
        assert!(run_now("systemctl", b"").1.starts_with("usage"));
    }
}
