//! Knowledge ingestion.
//!
//! Chunks text files on paragraph boundaries with overlap, stores each
//! chunk in the memory ledger with provenance metadata (source file,
//! offsets, chunk index), and keeps the search index in step.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use std::path::{Path, PathBuf};

use sonia_config::SoniaConfig;
use sonia_ledger::MemoryDatabase;

const DEFAULT_CHUNK_SIZE: usize = 1200;
const DEFAULT_OVERLAP: usize = 150;
const KNOWLEDGE_TYPE: &str = "knowledge_chunk";

/// Arguments for `sonia ingest`.
#[derive(Debug, Args)]
pub(crate) struct IngestArgs {
    /// A file or directory to ingest.
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Only ingest files with this extension (directories only).
    #[arg(long = "type", default_value = "txt")]
    pub file_type: String,

    /// Provenance tag stored on every chunk.
    #[arg(long)]
    pub tag: Option<String>,

    /// Target chunk size in characters.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Overlap carried between consecutive chunks, in characters.
    #[arg(long, default_value_t = DEFAULT_OVERLAP)]
    pub overlap: usize,

    /// Chunk and report without storing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// List previously ingested chunks instead of ingesting.
    #[arg(long)]
    pub list: bool,

    /// Print ledger statistics instead of ingesting.
    #[arg(long)]
    pub stats: bool,
}

pub(crate) fn run(config: &SoniaConfig, args: &IngestArgs) -> Result<()> {
    let ledger =
        MemoryDatabase::open(config.storage.memory_db_path()).context("open memory ledger")?;

    if args.stats {
        let stats = ledger.get_stats()?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    if args.list {
        let rows = ledger.list_by_type(KNOWLEDGE_TYPE, 200)?;
        for row in &rows {
            let source = row
                .metadata
                .as_ref()
                .and_then(|m| m["source_file"].as_str())
                .unwrap_or("?");
            let preview: String = row.content.chars().take(60).collect();
            println!("{}  {}  {}", row.id, source, preview.replace('\n', " "));
        }
        println!("{} chunk(s)", rows.len());
        return Ok(());
    }

    let source = args
        .source
        .as_ref()
        .context("--source is required unless --list or --stats")?;

    let files = collect_files(source, &args.file_type)?;
    anyhow::ensure!(!files.is_empty(), "nothing to ingest under {}", source.display());

    let mut total_chunks = 0usize;
    let mut stored = 0usize;
    for file in &files {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("read {}", file.display()))?;
        let chunks = chunk_by_paragraphs(&text, args.chunk_size, args.overlap);
        println!(
            "{}: {} chunk(s) (size={}, overlap={})",
            file.display(),
            chunks.len(),
            args.chunk_size,
            args.overlap
        );
        total_chunks += chunks.len();

        if args.dry_run {
            continue;
        }
        for (index, (chunk, start, end)) in chunks.iter().enumerate() {
            if chunk.trim().is_empty() {
                continue;
            }
            let mut metadata = json!({
                "source_type": "document_chunk",
                "source_file": file.display().to_string(),
                "chunk_index": index,
                "chunk_total": chunks.len(),
                "start_offset": start,
                "end_offset": end,
            });
            if let Some(tag) = &args.tag {
                metadata["tag"] = json!(tag);
            }
            ledger.store(KNOWLEDGE_TYPE, chunk, Some(&metadata))?;
            stored += 1;
        }
    }

    if args.dry_run {
        println!("dry run: {} file(s), {total_chunks} chunk(s), nothing stored", files.len());
    } else {
        println!("ingested {stored}/{total_chunks} chunk(s) from {} file(s)", files.len());
    }
    Ok(())
}

fn collect_files(source: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if source.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }
    anyhow::ensure!(source.is_dir(), "source not found: {}", source.display());
    let mut files: Vec<PathBuf> = std::fs::read_dir(source)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(extension))
        .collect();
    files.sort();
    Ok(files)
}

/// Chunk text on paragraph boundaries. Returns `(chunk, start, end)`
/// offsets into the source. The tail of each chunk (up to `overlap`
/// characters, aligned to a paragraph) seeds the next one.
fn chunk_by_paragraphs(
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Vec<(String, usize, usize)> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;
    let mut current_start = 0usize;
    let mut offset = 0usize;

    for paragraph in text.split("\n\n") {
        let paragraph_len = paragraph.len();
        if current_len + paragraph_len > chunk_size && !current.is_empty() {
            let chunk = current.join("\n\n");
            chunks.push((chunk.clone(), current_start, current_start + chunk.len()));

            // Seed the next chunk with trailing paragraphs up to the
            // overlap budget
            let mut carried: Vec<&str> = Vec::new();
            let mut carried_len = 0usize;
            for piece in current.iter().rev() {
                if carried_len + piece.len() > overlap {
                    break;
                }
                carried_len += piece.len();
                carried.insert(0, piece);
            }
            current_start = offset.saturating_sub(carried_len);
            current = carried;
            current_len = carried_len;
        }
        if current.is_empty() {
            current_start = offset;
        }
        current.push(paragraph);
        current_len += paragraph_len;
        offset += paragraph_len + 2;
    }

    if !current.is_empty() {
        let chunk = current.join("\n\n");
        if !chunk.trim().is_empty() {
            chunks.push((chunk.clone(), current_start, current_start + chunk.len()));
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_is_one_chunk() {
        let chunks = chunk_by_paragraphs("hello world", 100, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, "hello world");
        assert_eq!(chunks[0].1, 0);
    }

    #[test]
    fn test_splits_on_paragraphs() {
        let text = "aaaa\n\nbbbb\n\ncccc\n\ndddd";
        let chunks = chunk_by_paragraphs(text, 10, 0);
        assert!(chunks.len() > 1);
        // No chunk splits mid-paragraph
        for (chunk, _, _) in &chunks {
            for part in chunk.split("\n\n") {
                assert!(text.contains(part));
            }
        }
    }

    #[test]
    fn test_overlap_carries_tail() {
        let text = "first paragraph body\n\nsecond paragraph body\n\nthird paragraph body";
        let chunks = chunk_by_paragraphs(text, 25, 25);
        assert!(chunks.len() >= 2);
        // The second chunk starts with the carried paragraph
        assert!(chunks[1].0.contains("second") || chunks[1].0.contains("first"));
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_by_paragraphs("", 100, 10).is_empty());
    }
}
