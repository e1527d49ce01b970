use crate::interner::Symbol;

/// Character range into the source text.
pub type Span = std::ops::Range<usize>;

#[derive(Clone, Debug, PartialEq)]
pub struct Location {
    pub span: Span,
    pub path: Symbol,
}

impl Location {
    pub fn new(span: Span, path: Symbol) -> Self {
        Self { span, path }
    }
}

impl ariadne::Span for Location {
    type SourceId = Symbol;

    fn source(&self) -> &Self::SourceId {
        &self.path
    }

    fn start(&self) -> usize {
        self.span.start
    }

    fn end(&self) -> usize {
        self.span.end
    }
}

/// Name used for sources that do not come from a file.
pub(crate) const GLOBAL_LABEL: &str = "<script>";
