use ariadne::{ColorGenerator, Label, Report, ReportKind, Source};

use crate::interner::Symbol;

use super::metadata::Location;

pub trait ReportableError: std::error::Error {
    /// message is used for reporting verbose message for ariadne.
    fn get_message(&self) -> String {
        self.to_string()
    }
    /// label is used for indicating error with the specific position for ariadne.
    fn get_labels(&self) -> Vec<(Location, String)>;
    /// notes are appended below the source snippet (e.g. a traceback).
    fn get_notes(&self) -> Vec<String> {
        vec![]
    }
}

// one source per report, labels only carry a placeholder id
struct FileCache {
    src: ariadne::Source<String>,
    name: String,
}

impl ariadne::Cache<Symbol> for FileCache {
    type Storage = String;

    fn fetch(
        &mut self,
        _id: &Symbol,
    ) -> Result<&Source<Self::Storage>, Box<dyn std::fmt::Debug + '_>> {
        Ok(&self.src)
    }

    fn display<'a>(&self, _id: &'a Symbol) -> Option<Box<dyn std::fmt::Display + 'a>> {
        Some(Box::new(self.name.clone()))
    }
}

pub fn report(src: &str, path: Symbol, errs: &[Box<dyn ReportableError>]) {
    let mut colors = ColorGenerator::new();
    for e in errs {
        let rawlabels = e.get_labels();
        let offset = rawlabels.first().map_or(0, |(loc, _)| loc.span.start);
        let labels = rawlabels.iter().map(|(span, message)| {
            Label::new(span.clone())
                .with_message(message)
                .with_color(colors.next())
        });
        let mut builder = Report::build(ReportKind::Error, path, offset)
            .with_message(e.get_message())
            .with_labels(labels);
        for note in e.get_notes() {
            builder = builder.with_note(note);
        }
        let res = builder.finish().eprint(FileCache {
            src: ariadne::Source::from(src.to_string()),
            name: path.to_string(),
        });
        if let Err(ioerr) = res {
            log::error!("failed to print diagnostics: {ioerr}");
        }
    }
}

pub fn dump_to_string(errs: &[Box<dyn ReportableError>]) -> String {
    crate::format_vec!(errs, "\n")
}
