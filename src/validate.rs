use crate::probe::{PageScan, scan_pages};
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
}

impl DocumentKind {
    pub fn magic(self) -> &'static [u8] {
        match self {
            DocumentKind::Pdf => b"%PDF-",
        }
    }
}

/// Decides whether an engine's output is an openable document.
///
/// Never errors: every failure mode collapses into `false`, and a failure of
/// the deep check itself falls back to the header verdict.
#[derive(Debug, Clone)]
pub struct OutputValidator {
    deep_check: bool,
    deep_timeout: Duration,
}

enum DeepVerdict {
    Valid(u32),
    Invalid,
    Inconclusive(String),
}

impl OutputValidator {
    pub fn new(deep_timeout: Duration) -> Self {
        Self {
            deep_check: true,
            deep_timeout,
        }
    }

    pub fn header_only() -> Self {
        Self {
            deep_check: false,
            deep_timeout: Duration::ZERO,
        }
    }

    pub fn is_valid(&self, path: &Path, kind: DocumentKind) -> bool {
        if !header_matches(path, kind) {
            debug!("{} fails the {:?} header check", path.display(), kind);
            return false;
        }
        if !self.deep_check {
            return true;
        }
        match self.deep(path, kind) {
            DeepVerdict::Valid(pages) => {
                debug!("{} opened with {pages} pages", path.display());
                true
            }
            DeepVerdict::Invalid => false,
            DeepVerdict::Inconclusive(reason) => {
                debug!(
                    "deep check inconclusive for {} ({reason}); trusting header",
                    path.display()
                );
                true
            }
        }
    }

    fn deep(&self, path: &Path, kind: DocumentKind) -> DeepVerdict {
        match kind {
            DocumentKind::Pdf => match scan_pages(path, self.deep_timeout) {
                PageScan::Pages(0) => DeepVerdict::Invalid,
                PageScan::Pages(n) => DeepVerdict::Valid(n),
                PageScan::Unreadable(reason) => DeepVerdict::Inconclusive(reason),
                PageScan::TimedOut => DeepVerdict::Inconclusive("timed out".into()),
                PageScan::Busy => DeepVerdict::Inconclusive("no scan slot free".into()),
            },
        }
    }
}

fn header_matches(path: &Path, kind: DocumentKind) -> bool {
    let magic = kind.magic();
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut head = vec![0u8; magic.len()];
    file.read_exact(&mut head).is_ok() && head == magic
}
