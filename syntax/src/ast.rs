/// A single `key = value` entry. Both sides are trimmed;
/// case normalization is left to the consumer.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct KeyValue<'a> {
    pub key: &'a str,
    pub val: &'a str,
}

impl<'a> KeyValue<'a> {
    pub fn new(key: &'a str, val: &'a str) -> Self {
        Self { key, val }
    }
}

/// One meaningful line of a workflow definition file.
#[derive(Debug, PartialEq, Eq)]
pub enum Line<'a> {
    /// `**start`
    Start,
    /// `**end`
    End,
    /// `key = value`
    Entry(KeyValue<'a>),
}

/// Everything between a `**start` and its matching `**end`.
#[derive(Debug, PartialEq, Eq)]
pub struct Block<'a> {
    /// 1-based line number of the `**start` marker, for error messages.
    pub line: usize,
    pub entries: Vec<KeyValue<'a>>,
}
