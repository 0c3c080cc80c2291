//! `/who` support: which sites would answer this query? Runs an
//! all-sites vector search and histograms the sites of the top hits.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::retrieval::UnifiedRetriever;
use crate::state::SiteScope;

const SAMPLE_SIZE: usize = 50;
const TOP_SITES: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct SiteCount {
    pub site: String,
    pub count: usize,
}

pub async fn top_sites(
    retriever: &Arc<UnifiedRetriever>,
    query: &str,
) -> Result<Vec<SiteCount>, GatewayError> {
    let items = retriever
        .search(query, &SiteScope::All, SAMPLE_SIZE, None)
        .await?;

    let mut histogram: HashMap<String, usize> = HashMap::new();
    for item in items {
        if item.site.is_empty() {
            continue;
        }
        *histogram.entry(item.site).or_insert(0) += 1;
    }

    let mut counts: Vec<SiteCount> = histogram
        .into_iter()
        .map(|(site, count)| SiteCount { site, count })
        .collect();
    counts.sort_by(|a, b| b.count.cmp(&a.count).then(a.site.cmp(&b.site)));
    counts.truncate(TOP_SITES);
    Ok(counts)
}
