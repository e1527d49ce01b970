use super::*;
use crate::interner::ToSymbol;

fn collect(src: &str) -> Vec<TokenInfo> {
    let mut stream = TokenStream::new(src).unwrap();
    let mut res = vec![];
    loop {
        let info = stream.next_token().unwrap();
        let end = info.token == Token::EndOfInput;
        res.push(info);
        if end {
            break res;
        }
    }
}

#[test]
fn lines_and_columns() {
    let toks = collect("var a;\n  print(a);\n");
    assert_eq!(toks[0].line, 1);
    assert_eq!(toks[0].column, 1);
    assert_eq!(toks[1].token, Token::Ident("a".to_symbol()));
    assert_eq!(toks[1].column, 5);
    assert_eq!(toks[3].token, Token::Print);
    assert_eq!((toks[3].line, toks[3].column), (2, 3));
    let eof = toks.last().unwrap();
    assert_eq!(eof.token, Token::EndOfInput);
    assert_eq!(eof.line, 3);
}

#[test]
fn end_of_input_repeats() {
    let mut stream = TokenStream::new("").unwrap();
    for _ in 0..3 {
        assert_eq!(stream.next_token().unwrap().token, Token::EndOfInput);
    }
}

#[test]
fn too_many_lines() {
    let src = "\n".repeat(MAX_LINES) + "x";
    let mut stream = TokenStream::new(&src).unwrap();
    assert!(stream.next_token().is_err());

    let src = "\n".repeat(MAX_LINES - 1) + "x";
    let mut stream = TokenStream::new(&src).unwrap();
    assert_eq!(stream.next_token().unwrap().line, MAX_LINES as u16);
}

#[test]
fn columns_count_characters() {
    let toks = collect("var s = \"ü\"; s");
    assert_eq!(toks[3].token, Token::Str("ü".to_string()));
    assert_eq!(toks[3].span, 8..11);
    assert_eq!(toks[5].column, 14);
}
