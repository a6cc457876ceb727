use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub page_count: u32,
    pub chunks: Vec<ChunkTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkTask {
    pub chunk_index: u32,
    pub start_page: u32, // 1-based inclusive
    pub end_page: u32,   // 1-based inclusive
    pub output_path: PathBuf,
}

impl ChunkTask {
    pub fn pages(&self) -> u32 {
        self.end_page - self.start_page + 1
    }
}

/// Whether an input with `page_count` pages is large enough for the parallel tier.
pub fn should_chunk(cfg: &Config, page_count: u32) -> bool {
    cfg.chunking.enabled && page_count > cfg.chunking.threshold_pages
}

impl ChunkPlan {
    pub fn plan(page_count: u32, chunk_size_pages: u32, out_dir: &Path) -> ChunkPlan {
        let size = chunk_size_pages.max(1);

        let mut chunks = Vec::new();
        let mut p = 1u32;
        while p <= page_count {
            let end = p.saturating_add(size - 1).min(page_count);
            let chunk_index = chunks.len() as u32;
            chunks.push(ChunkTask {
                chunk_index,
                start_page: p,
                end_page: end,
                output_path: out_dir.join(format!("chunk_{:05}.pdf", chunk_index)),
            });
            p = end + 1;
        }

        ChunkPlan { page_count, chunks }
    }

    pub fn from_config(cfg: &Config, page_count: u32, out_dir: &Path) -> ChunkPlan {
        Self::plan(page_count, cfg.chunking.chunk_size_pages, out_dir)
    }

    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.chunks.iter().map(|c| c.output_path.clone()).collect()
    }
}
