use super::token::*;
use crate::interner::ToSymbol;
use crate::runtime::vm::TypeId;
use crate::utils::metadata::*;
use chumsky::prelude::*;
use chumsky::Parser;

// `#` starts a comment running to the end of the line.
fn whitespace_parser() -> impl Parser<char, (), Error = Simple<char>> + Clone {
    let comment = just('#')
        .then(filter(|c: &char| *c != '\n').repeated())
        .ignored();
    text::whitespace()
        .at_least(1)
        .ignored()
        .or(comment)
        .repeated()
        .ignored()
}

pub fn lexer() -> impl Parser<char, Vec<(Token, Span)>, Error = Simple<char>> {
    // "1." has no digits after the dot and is rejected here rather than in the parser
    let number = text::digits(10)
        .then(just('.').ignore_then(text::digits(10).or_not()).or_not())
        .map(|(int, frac): (String, Option<Option<String>>)| match frac {
            None => Token::Number(int),
            Some(Some(frac)) => Token::Number(format!("{int}.{frac}")),
            Some(None) => Token::Error("Malformed number".to_string()),
        });

    let escape = just('\\').ignore_then(any().map(|c| match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }));
    let str_ = just('"')
        .ignore_then(
            filter(|c: &char| *c != '"' && *c != '\\')
                .or(escape)
                .repeated()
                .collect::<String>(),
        )
        .then(just('"').or_not())
        .map(|(s, close)| match close {
            Some(_) => Token::Str(s),
            None => Token::Error("Unterminated string".to_string()),
        });

    let op = choice((
        just("==").to(Token::Op(Op::Equal)),
        just("!=").to(Token::Op(Op::NotEqual)),
        just("<=").to(Token::Op(Op::LessEqual)),
        just(">=").to(Token::Op(Op::GreaterEqual)),
        just(":=").to(Token::ColonEqual),
        just("<").to(Token::Op(Op::LessThan)),
        just(">").to(Token::Op(Op::GreaterThan)),
        just("!").to(Token::Op(Op::Not)),
        just("+").to(Token::Op(Op::Sum)),
        just("-").to(Token::Op(Op::Minus)),
        just("*").to(Token::Op(Op::Product)),
        just("/").to(Token::Op(Op::Divide)),
        just("=").to(Token::Assign),
    ));

    let separator = one_of(",:;").map(|c| match c {
        ',' => Token::Comma,
        ':' => Token::Colon,
        _ => Token::SemiColon,
    });

    let ident = text::ident().map(|ident: String| match ident.as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "var" => Token::Var,
        "const" => Token::Const,
        "fn" => Token::Function,
        "if" => Token::If,
        "elif" => Token::Elif,
        "else" => Token::Else,
        "while" => Token::While,
        "for" => Token::For,
        "in" => Token::In,
        "return" => Token::Return,
        "print" => Token::Print,
        "echo" => Token::Echo,
        "type" => Token::TypeOf,
        "true" => Token::True,
        "false" => Token::False,
        "nil" => Token::Nil,
        "bool" => Token::TypeLit(TypeId::Bool),
        "float" => Token::TypeLit(TypeId::Float),
        "string" => Token::TypeLit(TypeId::String),
        "list" => Token::TypeLit(TypeId::List),
        "function" => Token::TypeLit(TypeId::Function),
        "typeid" => Token::TypeLit(TypeId::TypeId),
        _ => Token::Ident(ident.to_symbol()),
    });

    let parens = one_of("(){}[]").map(|c| match c {
        '(' => Token::ParenBegin,
        ')' => Token::ParenEnd,
        '{' => Token::BlockBegin,
        '}' => Token::BlockEnd,
        '[' => Token::ArrayBegin,
        _ => Token::ArrayEnd,
    });

    let unknown = any().map(|_| Token::Error("Unexpected character".to_string()));

    let token = number
        .or(str_)
        .or(op)
        .or(separator)
        .or(ident)
        .or(parens)
        .or(unknown);

    whitespace_parser()
        .ignore_then(
            token
                .map_with_span(|tok, span| (tok, span))
                .then_ignore(whitespace_parser())
                .repeated(),
        )
        .then_ignore(end())
}

#[cfg(test)]
mod test {
    use super::*;

    fn lex(src: &str) -> Vec<(Token, Span)> {
        let (res, errs) = lexer().parse_recovery(src);
        assert!(errs.is_empty(), "{errs:?}");
        res.unwrap()
    }

    #[test]
    fn test_var() {
        let ans = [
            (Token::Var, 0..3),
            (Token::Ident("hoge".to_symbol()), 4..8),
            (Token::Assign, 9..10),
            (Token::Number("36".to_string()), 11..13),
            (Token::SemiColon, 13..14),
        ];
        assert_eq!(lex("var hoge = 36;"), ans);
    }

    #[test]
    fn comment() {
        let src = "a # comment here\n# whole line\nb";
        let ans = [
            (Token::Ident("a".to_symbol()), 0..1),
            (Token::Ident("b".to_symbol()), 30..31),
        ];
        assert_eq!(lex(src), ans);
    }

    #[test]
    fn operators_and_ranges() {
        let toks = lex("a<=b != c :=d:e")
            .into_iter()
            .map(|(t, _)| t)
            .collect::<Vec<_>>();
        assert_eq!(
            toks,
            [
                Token::Ident("a".to_symbol()),
                Token::Op(Op::LessEqual),
                Token::Ident("b".to_symbol()),
                Token::Op(Op::NotEqual),
                Token::Ident("c".to_symbol()),
                Token::ColonEqual,
                Token::Ident("d".to_symbol()),
                Token::Colon,
                Token::Ident("e".to_symbol()),
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(lex("1.25")[0].0, Token::Number("1.25".to_string()));
        assert_eq!(lex("7")[0].0, Token::Number("7".to_string()));
        assert_eq!(lex("1.")[0].0, Token::Error("Malformed number".to_string()));
    }

    #[test]
    fn strings() {
        assert_eq!(
            lex(r#""a\"b\n""#)[0].0,
            Token::Str("a\"b\n".to_string())
        );
        assert_eq!(
            lex("\"open")[0].0,
            Token::Error("Unterminated string".to_string())
        );
    }

    #[test]
    fn keywords_and_types() {
        let toks = lex("fn elif echo type typeid float nil")
            .into_iter()
            .map(|(t, _)| t)
            .collect::<Vec<_>>();
        assert_eq!(
            toks,
            [
                Token::Function,
                Token::Elif,
                Token::Echo,
                Token::TypeOf,
                Token::TypeLit(TypeId::TypeId),
                Token::TypeLit(TypeId::Float),
                Token::Nil,
            ]
        );
    }

    #[test]
    fn unexpected_character() {
        let toks = lex("a $ b");
        assert_eq!(toks[1], (Token::Error("Unexpected character".to_string()), 2..3));
        assert_eq!(toks.len(), 3);
    }
}
