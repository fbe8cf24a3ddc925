use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, none_of},
    combinator::{map, map_res, not, opt, peek, recognize, value},
    error::ParseError,
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};

// Whitespace wrapper
fn ws<'a, F, O, E: ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where
    F: FnMut(&'a str) -> IResult<&'a str, O, E>,
{
    delimited(multispace0, inner, multispace0)
}

/// Word operators (`in`, `and`, `or`, `not`, `matches`) must not swallow the
/// prefix of an identifier like `inactive`.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input| {
        let (rest, matched) = tag(word)(input)?;
        let (rest, _) = peek(not(alt((alphanumeric1::<&str, _>, tag("_")))))(rest)?;
        Ok((rest, matched))
    }
}

fn parse_segment(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0(alt((alphanumeric1, tag("_")))),
        )),
        String::from,
    )(input)
}

// Dotted paths: record.total, user.roles
fn parse_path(input: &str) -> IResult<&str, Expr> {
    map(
        pair(parse_segment, many0(preceded(char('.'), parse_segment))),
        |(head, tail)| {
            let mut segments = vec![head];
            segments.extend(tail);
            Expr::Path(segments)
        },
    )(input)
}

fn parse_number(input: &str) -> IResult<&str, Literal> {
    map_res(
        recognize(tuple((digit1, opt(tuple((char('.'), digit1)))))),
        |text: &str| {
            if text.contains('.') {
                text.parse::<f64>().map(Literal::Float).map_err(|_| ())
            } else {
                text.parse::<i64>().map(Literal::Int).map_err(|_| ())
            }
        },
    )(input)
}

fn parse_string_literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(
            delimited(
                char('"'),
                many0(alt((
                    value('"', tag("\\\"")),
                    value('\\', tag("\\\\")),
                    value('\n', tag("\\n")),
                    value('\t', tag("\\t")),
                    none_of("\"\\"),
                ))),
                char('"'),
            ),
            |chars| Literal::Str(chars.into_iter().collect()),
        ),
        map(
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
            |text: &str| Literal::Str(text.to_string()),
        ),
    ))(input)
}

fn parse_literal(input: &str) -> IResult<&str, Literal> {
    alt((
        value(Literal::Bool(true), keyword("true")),
        value(Literal::Bool(false), keyword("false")),
        value(Literal::Null, keyword("null")),
        parse_number,
        parse_string_literal,
    ))(input)
}

fn parse_list(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            ws(char('[')),
            separated_list0(ws(char(',')), parse_expr),
            ws(char(']')),
        ),
        Expr::List,
    )(input)
}

fn parse_call(input: &str) -> IResult<&str, Expr> {
    map(
        tuple((
            parse_segment,
            ws(char('(')),
            separated_list0(ws(char(',')), parse_expr),
            ws(char(')')),
        )),
        |(name, _, args, _)| Expr::Call { name, args },
    )(input)
}

fn parse_primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        map(parse_literal, Expr::Literal),
        parse_list,
        parse_call,
        parse_path,
        delimited(ws(char('(')), parse_expr, ws(char(')'))),
    )))(input)
}

fn parse_unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            preceded(ws(alt((tag("!"), keyword("not")))), parse_unary),
            |expr| Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            },
        ),
        map(preceded(ws(char('-')), parse_unary), |expr| Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(expr),
        }),
        parse_primary,
    ))(input)
}

fn parse_multiplicative(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_unary(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::Mul, char('*')),
            value(BinaryOp::Div, char('/')),
            value(BinaryOp::Mod, char('%')),
        ))),
        parse_unary,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn parse_additive(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_multiplicative(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::Add, char('+')),
            value(BinaryOp::Sub, char('-')),
        ))),
        parse_multiplicative,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn parse_comparison(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_additive(input)?;
    let (input, tail) = opt(pair(
        ws(alt((
            value(BinaryOp::Eq, tag("==")),
            value(BinaryOp::Ne, tag("!=")),
            value(BinaryOp::Le, tag("<=")),
            value(BinaryOp::Ge, tag(">=")),
            value(BinaryOp::Lt, char('<')),
            value(BinaryOp::Gt, char('>')),
            value(BinaryOp::In, keyword("in")),
            value(BinaryOp::Matches, keyword("matches")),
        ))),
        parse_additive,
    ))(input)?;

    Ok((
        input,
        match tail {
            Some((op, right)) => Expr::Binary {
                op,
                left: Box::new(first),
                right: Box::new(right),
            },
            None => first,
        },
    ))
}

fn parse_and(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_comparison(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::And, tag("&&")),
            value(BinaryOp::And, keyword("and")),
        ))),
        parse_comparison,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn parse_or(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_and(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::Or, tag("||")),
            value(BinaryOp::Or, keyword("or")),
        ))),
        parse_and,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn parse_expr(input: &str) -> IResult<&str, Expr> {
    parse_or(input)
}

fn fold_binary(first: Expr, rest: Vec<(BinaryOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |left, (op, right)| Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

/// Parse a complete expression; trailing input is a parse error.
pub fn parse(input: &str) -> Result<Expr, String> {
    match parse_expr(input) {
        Ok((rest, expr)) if rest.trim().is_empty() => Ok(expr),
        Ok((rest, _)) => Err(format!("Unexpected trailing input: '{}'", rest.trim())),
        Err(error) => Err(format!("Parse error: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_paths_and_literals() {
        assert_eq!(
            parse("record.total").unwrap(),
            Expr::Path(vec!["record".into(), "total".into()])
        );
        assert_eq!(parse("42").unwrap(), Expr::Literal(Literal::Int(42)));
        assert_eq!(parse("4.5").unwrap(), Expr::Literal(Literal::Float(4.5)));
        assert_eq!(
            parse("\"a \\\"b\\\"\"").unwrap(),
            Expr::Literal(Literal::Str("a \"b\"".into()))
        );
        assert_eq!(parse("null").unwrap(), Expr::Literal(Literal::Null));
    }

    #[test]
    fn keyword_operators_do_not_eat_identifiers() {
        // `inactive` is a path, not `in` + `active`
        assert_eq!(parse("inactive").unwrap(), Expr::Path(vec!["inactive".into()]));
        let expr = parse("record.status in [\"open\", \"held\"]").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::In, .. } => {}
            other => panic!("expected `in` binary, got {other:?}"),
        }
    }

    #[test]
    fn precedence_mul_over_add_over_compare_over_bool() {
        let expr = parse("record.a + 2 * 3 > 10 && record.b == \"x\"").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::And, left, right } => {
                match *left {
                    Expr::Binary { op: BinaryOp::Gt, .. } => {}
                    other => panic!("expected Gt on the left, got {other:?}"),
                }
                match *right {
                    Expr::Binary { op: BinaryOp::Eq, .. } => {}
                    other => panic!("expected Eq on the right, got {other:?}"),
                }
            }
            other => panic!("expected And at the root, got {other:?}"),
        }
    }

    #[test]
    fn parses_calls_and_matches() {
        let expr = parse("len(record.items) > 0").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::Gt, left, .. } => match *left {
                Expr::Call { ref name, ref args } => {
                    assert_eq!(name, "len");
                    assert_eq!(args.len(), 1);
                }
                other => panic!("expected call, got {other:?}"),
            },
            other => panic!("expected Gt, got {other:?}"),
        }

        let expr = parse("record.email matches \"^[a-z]+@\"").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::Matches, .. } => {}
            other => panic!("expected matches, got {other:?}"),
        }
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse("record.a record.b").is_err());
        assert!(parse("").is_err());
    }
}
