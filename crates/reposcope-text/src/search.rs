use anyhow::Result;
use std::collections::BTreeSet;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{IndexRecordOption, Value};
use tantivy::{TantivyDocument, Term};

use reposcope_core::types::{EngineSource, SearchResult};

use crate::index::TextIndex;
use crate::tantivy_utils::analyze;

impl TextIndex {
	/// BM25 search for the disjunction of the analyzed `terms`.
	///
	/// Input is never parsed as query syntax. Results are ordered by score
	/// descending, then chunk_id ascending.
	pub fn query(&self, terms: &[String], k: usize) -> Result<Vec<SearchResult>> {
		if k == 0 {
			return Ok(Vec::new());
		}
		let mut analyzer = self.index.tokenizer_for_field(self.fields.text)?;
		let analyzed: BTreeSet<String> = terms.iter().flat_map(|t| analyze(&mut analyzer, t)).collect();
		if analyzed.is_empty() {
			return Ok(Vec::new());
		}

		let clauses: Vec<(Occur, Box<dyn Query>)> = analyzed
			.iter()
			.map(|t| {
				let term = Term::from_field_text(self.fields.text, t);
				(Occur::Should, Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs)) as Box<dyn Query>)
			})
			.collect();
		let query = BooleanQuery::new(clauses);

		let searcher = self.reader.searcher();
		let top_docs = searcher.search(&query, &TopDocs::with_limit((k * 4).max(k + 32)))?;
		let mut hits = Vec::with_capacity(top_docs.len());
		for (score, addr) in top_docs {
			let doc: TantivyDocument = searcher.doc(addr)?;
			if let Some(id) = doc.get_first(self.fields.chunk_id).and_then(|v| v.as_str()) {
				hits.push((id.to_string(), score));
			}
		}
		hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
		hits.truncate(k);
		Ok(SearchResult::rank_list(EngineSource::Statistical, hits))
	}
}
