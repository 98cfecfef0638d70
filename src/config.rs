//! `/boot.cfg` parsing and boot-image selection.
//!
//! Plain `key = value` lines, `#` comments, whitespace-tolerant, unknown
//! keys ignored. Everything is bounded: paths cap at 64 bytes and the
//! whole file is read through a fixed buffer by the orchestrator.

use heapless::String;

pub const DEFAULT_IMAGE: &str = "/boot/kernel.elf";
pub const DEFAULT_FALLBACK: &str = "/boot/recovery.elf";
pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Path capacity, in bytes.
pub const MAX_PATH: usize = 64;

/// Where the orchestrator looks for the file.
pub const CONFIG_PATH: &str = "/boot.cfg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub image_path: String<MAX_PATH>,
    pub fallback_path: String<MAX_PATH>,
    pub has_fallback: bool,

    /// Menu timeout; parsed and reported, but there is no menu to drive.
    pub timeout_ms: u32,
    pub boot_delay_ms: u32,

    pub console_baud: u32,
    pub verbose: bool,
    pub quiet: bool,

    pub verify: bool,
    pub reset_on_fail: bool,
    pub max_retries: u32,

    /// Boot attempts this power-on. Not persisted across resets.
    pub boot_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        let mut image_path = String::new();
        let _ = image_path.push_str(DEFAULT_IMAGE);
        let mut fallback_path = String::new();
        let _ = fallback_path.push_str(DEFAULT_FALLBACK);

        Self {
            image_path,
            fallback_path,
            has_fallback: true,

            timeout_ms: 0,
            boot_delay_ms: 0,

            console_baud: DEFAULT_BAUD,
            verbose: true,
            quiet: false,

            verify: false,
            reset_on_fail: true,
            max_retries: DEFAULT_MAX_RETRIES,

            boot_count: 0,
        }
    }
}

/// Leading decimal digits; 0 if there are none.
fn parse_u32(s: &str) -> u32 {
    s.bytes()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u32, |acc, b| {
            acc.wrapping_mul(10).wrapping_add((b - b'0') as u32)
        })
}

fn parse_bool(s: &str) -> bool {
    matches!(s, "1" | "true" | "yes" | "on")
}

fn copy_path(dst: &mut String<MAX_PATH>, value: &str) {
    let mut next = String::new();
    if next.push_str(value).is_ok() {
        *dst = next;
    } else {
        log::warn!("config: path longer than {} bytes ignored", MAX_PATH);
    }
}

impl Config {
    /// Parses a whole config file's text. Lines that don't parse are
    /// skipped, never fatal.
    pub fn parse(&mut self, text: &str) {
        for line in text.lines() {
            self.parse_line(line);
        }
    }

    fn parse_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }

        let (key, value) = match line.split_once('=') {
            Some(kv) => kv,
            None => return,
        };

        let key = key.trim();
        // A comment can trail the value.
        let value = match value.split_once('#') {
            Some((v, _)) => v.trim(),
            None => value.trim(),
        };

        match key {
            "image" => copy_path(&mut self.image_path, value),
            "fallback" => {
                copy_path(&mut self.fallback_path, value);
                self.has_fallback = true;
            }
            "timeout" => self.timeout_ms = parse_u32(value),
            "delay" => self.boot_delay_ms = parse_u32(value),
            "baudrate" | "baud" => self.console_baud = parse_u32(value),
            "verbose" => self.verbose = parse_bool(value),
            "quiet" => {
                self.quiet = parse_bool(value);
                if self.quiet {
                    self.verbose = false;
                }
            }
            "verify" => self.verify = parse_bool(value),
            "reset_on_fail" => self.reset_on_fail = parse_bool(value),
            "max_retries" | "retries" => self.max_retries = parse_u32(value),
            _ => {} // unknown keys are ignored
        }
    }

    /// The image to try this attempt: the primary, or the fallback once
    /// the attempt counter has burned through `max_retries`.
    pub fn select_image(&self) -> Option<&str> {
        if self.boot_count >= self.max_retries
            && self.has_fallback
            && !self.fallback_path.is_empty()
        {
            return Some(self.fallback_path.as_str());
        }

        if !self.image_path.is_empty() {
            return Some(self.image_path.as_str());
        }

        None
    }

    pub fn boot_attempt(&mut self) {
        self.boot_count += 1;
    }

    pub fn boot_success(&mut self) {
        self.boot_count = 0;
    }

    /// The log verbosity this configuration asks for.
    pub fn log_level(&self) -> log::LevelFilter {
        if self.quiet {
            log::LevelFilter::Off
        } else if self.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }
}
