use core::fmt::{self, Write};

use log::{Log, Metadata, Record};
use x86_64::instructions::port::Port;

use crate::spin::mutex::Mutex;

const COM1: u16 = 0x3f8;

static WRITER: Mutex<SerialWriter> = Mutex::new(SerialWriter { port: COM1 });

struct SerialWriter {
    port: u16,
}

impl SerialWriter {
    fn put(&mut self, byte: u8) {
        let mut lsr = Port::<u8>::new(self.port + 5);
        let mut thr = Port::<u8>::new(self.port);
        unsafe {
            while lsr.read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
            thr.write(byte);
        }
    }
}

impl Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.put(b'\r');
            }
            self.put(byte);
        }
        Ok(())
    }
}

pub struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        !matches!(
            metadata.target(),
            "kernel::exception" | "kernel::memory::pagetable"
        )
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level_color = match record.level() {
            log::Level::Error => "\x1b[31m",
            log::Level::Warn => "\x1b[33m",
            log::Level::Info => "\x1b[34m",
            log::Level::Debug => "\x1b[32m",
            log::Level::Trace => "\x1b[35m",
        };
        let reset_color = "\x1b[0m";

        // Take the lock without potentially triggering a stall warning.
        let mut guard = {
            loop {
                if let Some(guard) = WRITER.try_lock() {
                    break guard;
                }
            }
        };

        let _ = writeln!(
            guard,
            "{level_color}[{:<5} {}:{}]{reset_color} {}",
            record.level(),
            record.file().unwrap_or("<unknown>"),
            record.line().unwrap_or(0),
            record.args(),
        );
    }

    fn flush(&self) {}
}

/// Raw console output for the console fd and the panic path.
pub fn write_console(bytes: &[u8]) {
    let mut guard = WRITER.lock();
    for &byte in bytes {
        if byte == b'\n' {
            guard.put(b'\r');
        }
        guard.put(byte);
    }
}
