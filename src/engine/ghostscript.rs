use super::{CompressRequest, CompressionMode, Engine};
use crate::error::TierFailure;
use crate::supervisor::{ProcessOutput, ProcessSupervisor};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Ghostscript `pdfwrite`: re-renders the document, downsampling images.
pub struct GhostscriptEngine {
    exe: String,
}

impl GhostscriptEngine {
    pub fn new(exe: &str) -> Self {
        Self {
            exe: exe.to_string(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        [
            "-sDEVICE=pdfwrite",
            "-dCompatibilityLevel=1.5",
            "-dNOPAUSE",
            "-dBATCH",
            "-dQUIET",
            "-dSAFER",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn compress_args(&self, req: &CompressRequest) -> Vec<String> {
        let mut args = self.base_args();
        args.push(format!("-dPDFSETTINGS={}", req.settings.tier.preset()));
        args.push("-dDetectDuplicateImages=true".into());
        args.push("-dCompressFonts=true".into());

        match req.mode {
            CompressionMode::Resize => {
                let dpi = req.settings.dpi;
                for kind in ["Color", "Gray"] {
                    args.push(format!("-dDownsample{kind}Images=true"));
                    args.push(format!("-d{kind}ImageDownsampleType=/Bicubic"));
                    args.push(format!("-d{kind}ImageResolution={dpi}"));
                }
                args.push("-dDownsampleMonoImages=true".into());
                args.push(format!("-dMonoImageResolution={}", dpi * 2));
            }
            CompressionMode::Simple => {
                for kind in ["Color", "Gray", "Mono"] {
                    args.push(format!("-dDownsample{kind}Images=false"));
                }
            }
        }

        if let Some((first, last)) = req.page_range {
            args.push(format!("-dFirstPage={first}"));
            args.push(format!("-dLastPage={last}"));
        }

        args.push(output_file_arg(&req.output));
        args.push(req.input.display().to_string());
        args
    }

    pub fn merge_args(&self, parts: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = self.base_args();
        args.push(output_file_arg(output));
        args.extend(parts.iter().map(|p| p.display().to_string()));
        args
    }
}

/// Ghostscript expands `%d` in the output name to a page number; `%%` is a literal `%`.
fn output_file_arg(path: &Path) -> String {
    format!("-sOutputFile={}", path.display().to_string().replace('%', "%%"))
}

impl Engine for GhostscriptEngine {
    fn name(&self) -> &str {
        "ghostscript"
    }

    fn tool(&self) -> &str {
        &self.exe
    }

    fn supports_page_range(&self) -> bool {
        true
    }

    fn supports_merge(&self) -> bool {
        true
    }

    fn compress(
        &self,
        req: &CompressRequest,
        supervisor: &ProcessSupervisor,
        timeout: Duration,
    ) -> Result<ProcessOutput, TierFailure> {
        let args = self.compress_args(req);
        debug!("gs {}", args.join(" "));
        Ok(supervisor.run(&self.exe, args.as_slice(), None, timeout)?)
    }

    fn merge(
        &self,
        parts: &[PathBuf],
        output: &Path,
        supervisor: &ProcessSupervisor,
        timeout: Duration,
    ) -> Result<ProcessOutput, TierFailure> {
        let args = self.merge_args(parts, output);
        debug!("gs merge of {} parts into {}", parts.len(), output.display());
        Ok(supervisor.run(&self.exe, args.as_slice(), None, timeout)?)
    }
}
