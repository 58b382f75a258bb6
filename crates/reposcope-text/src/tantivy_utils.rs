use tantivy::schema::{Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, STORED, STRING};
use tantivy::tokenizer::{Language, LowerCaser, SimpleTokenizer, Stemmer, StopWordFilter, TextAnalyzer, Token, TokenStream};
use tantivy::Index;

pub const CODE_TEXT_TOKENIZER: &str = "code_text";

const STOP_WORDS: &[&str] = &[
	"a","an","and","are","as","at","be","by","for","from","has","he","in","is","it","its","of","on","that","the","to","was","will","with","or","but","not","this","these","they","them","their","there","then","than","so","if","when","where","why","how","what","which","who","whom","whose","can","could","should","would","may","might","must","shall","do","does","did","have","had","having",
];

#[derive(Debug, Clone, Copy)]
pub struct Fields {
	pub chunk_id: Field,
	pub file_path: Field,
	pub text: Field,
}

impl Fields {
	pub fn from_schema(schema: &Schema) -> tantivy::Result<Self> {
		Ok(Self {
			chunk_id: schema.get_field("chunk_id")?,
			file_path: schema.get_field("file_path")?,
			text: schema.get_field("text")?,
		})
	}
}

pub fn build_schema() -> Schema {
	let mut schema_builder = Schema::builder();
	schema_builder.add_text_field("chunk_id", STRING | STORED);
	schema_builder.add_text_field("file_path", STRING | STORED);
	let text_field_indexing = TextFieldIndexing::default()
		.set_tokenizer(CODE_TEXT_TOKENIZER)
		.set_index_option(IndexRecordOption::WithFreqsAndPositions);
	schema_builder.add_text_field("text", TextOptions::default().set_indexing_options(text_field_indexing));
	schema_builder.build()
}

/// Splits on non-alphanumerics (`validate_jwt` → `validate`, `jwt`), lowercases,
/// drops English stop words and stems.
pub fn code_text_analyzer() -> TextAnalyzer {
	TextAnalyzer::builder(SimpleTokenizer::default())
		.filter(LowerCaser)
		.filter(StopWordFilter::remove(STOP_WORDS.iter().map(|s| s.to_string())))
		.filter(Stemmer::new(Language::English))
		.build()
}

pub fn register_tokenizer(index: &Index) {
	index.tokenizers().register(CODE_TEXT_TOKENIZER, code_text_analyzer());
}

/// Runs `text` through `analyzer` and returns the produced terms in order.
pub fn analyze(analyzer: &mut TextAnalyzer, text: &str) -> Vec<String> {
	let mut terms = Vec::new();
	let mut stream = analyzer.token_stream(text);
	stream.process(&mut |token: &Token| terms.push(token.text.clone()));
	terms
}
