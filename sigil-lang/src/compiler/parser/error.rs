use crate::interner::ToSymbol;
use crate::utils::{
    error::ReportableError,
    metadata::{Location, GLOBAL_LABEL},
};
use chumsky;
use std::fmt;
use std::hash::Hash;

#[derive(Debug)]
pub struct ParseError<T>(pub chumsky::error::Simple<T>)
where
    T: Hash + std::cmp::Eq + fmt::Debug + fmt::Display;

impl<T> fmt::Display for ParseError<T>
where
    T: Hash + std::cmp::Eq + fmt::Debug + fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.get_message())
    }
}

impl<T> std::error::Error for ParseError<T> where T: Hash + std::cmp::Eq + fmt::Debug + fmt::Display {}

impl<T> ReportableError for ParseError<T>
where
    T: Hash + std::cmp::Eq + fmt::Debug + fmt::Display,
{
    fn get_message(&self) -> String {
        match self.0.reason() {
            chumsky::error::SimpleReason::Custom(msg) => msg.clone(),
            _ => format!(
                "Unexpected {}",
                self.0
                    .found()
                    .map(|c| format!("character '{c}'"))
                    .unwrap_or_else(|| "end of input".to_string())
            ),
        }
    }
    fn get_labels(&self) -> Vec<(Location, String)> {
        let loc = Location::new(self.0.span(), GLOBAL_LABEL.to_symbol());
        vec![(loc, self.get_message())]
    }
}
