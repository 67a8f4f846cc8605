use anyhow::{bail, Result};

use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::index::{PineconeIndex, QueryMatch, VectorIndex};
use crate::sparse::encode_query;

pub async fn run_search(config: &Config, query: &str, limit: usize) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let embedder = create_embedder(&config.embedding)?;
    let index = PineconeIndex::from_config(&config.index)?;
    let results = search(&index, embedder.as_ref(), query, limit).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in results.iter().enumerate() {
        print_hit(i + 1, hit);
    }
    Ok(())
}

/// Dense query, plus the query's sparse terms when it has any.
pub async fn search(
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
    query: &str,
    limit: usize,
) -> Result<Vec<QueryMatch>> {
    let vector = embedder.embed_query(query).await?;
    let sparse = encode_query(query);
    let sparse = Some(&sparse).filter(|s| !s.is_empty());
    index.query(&vector, sparse, limit.max(1)).await
}

fn field<'a>(hit: &'a QueryMatch, key: &str) -> &'a str {
    hit.metadata.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn print_hit(rank: usize, hit: &QueryMatch) {
    let name = Some(field(hit, "file_name"))
        .filter(|n| !n.is_empty())
        .unwrap_or("(unnamed)");
    let modified = field(hit, "modified");
    let date = chrono::DateTime::parse_from_rfc3339(modified)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| modified.to_string());

    println!("{}. [{:.2}] {}", rank, hit.score, name);
    println!("    path: {}", field(hit, "file_path"));
    println!("    modified: {}", date);
    println!(
        "    excerpt: \"{}\"",
        crate::extract::truncate_chars(field(hit, "text_preview"), 240)
            .replace('\n', " ")
            .trim()
    );
    println!("    id: {}", hit.id);
    println!();
}
