use sqli_db::RowFlow;

/// Rows produced by one statement execution.
///
/// Column names are fixed by the first row delivered. Values are kept
/// tri-state: `None` is SQL NULL, `Some("")` is empty text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowSink {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl RowSink {
    pub fn with_columns(columns: &[String]) -> Self {
        Self {
            columns: columns.to_vec(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, values: &[Option<String>]) {
        self.rows.push(values.to_vec());
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, index: usize) -> Option<&[Option<String>]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Position of `name`, compared case-insensitively.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }

    /// Row callback body: allocates the sink on the first row, then appends.
    pub(crate) fn ingest(
        slot: &mut Option<RowSink>,
        columns: &[String],
        values: &[Option<String>],
    ) -> RowFlow {
        if columns.is_empty() {
            return RowFlow::Continue;
        }
        slot.get_or_insert_with(|| RowSink::with_columns(columns))
            .push_row(values);
        RowFlow::Continue
    }
}
