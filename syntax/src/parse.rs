use anyhow::Result;

use crate::ast::{Block, KeyValue, Line};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ParseError on line {line_no} '{line}': {msg}")]
    Syntax {
        msg: String,
        line_no: usize,
        line: String,
    },
    #[error("Line {0}: '**start' inside a block that was never closed")]
    NestedBlock(usize),
    #[error("Line {0}: '**end' without a matching '**start'")]
    UnmatchedEnd(usize),
    #[error("Line {0}: entry outside of a '**start'/'**end' block")]
    EntryOutsideBlock(usize),
    #[error("Block starting on line {0} is never closed with '**end'")]
    UnclosedBlock(usize),
}

/// Parse a workflow definition file into its `**start`/`**end` blocks.
pub fn parse_workflow(text: &str) -> Result<Vec<Block<'_>>> {
    let mut blocks = Vec::with_capacity(8);
    let mut open: Option<Block> = None;

    for (i, raw) in text.lines().enumerate() {
        let line_no = i + 1;
        let parsed = parse_line(workflow::line(), raw, line_no)?;
        match parsed {
            None => {}
            Some(Line::Start) => {
                if open.is_some() {
                    return Err(Error::NestedBlock(line_no).into());
                }
                open = Some(Block {
                    line: line_no,
                    entries: Vec::with_capacity(16),
                });
            }
            Some(Line::End) => match open.take() {
                Some(block) => blocks.push(block),
                None => return Err(Error::UnmatchedEnd(line_no).into()),
            },
            Some(Line::Entry(kv)) => match open.as_mut() {
                Some(block) => block.entries.push(kv),
                None => return Err(Error::EntryOutsideBlock(line_no).into()),
            },
        }
    }

    if let Some(block) = open {
        return Err(Error::UnclosedBlock(block.line).into());
    }
    Ok(blocks)
}

/// Parse a flat `KEY = value` file (INCAR-style), skipping blank and comment lines.
pub fn parse_key_values(text: &str) -> Result<Vec<KeyValue<'_>>> {
    let mut entries = Vec::with_capacity(32);
    for (i, raw) in text.lines().enumerate() {
        if let Some(kv) = parse_line(key_values::line(), raw, i + 1)? {
            entries.push(kv);
        }
    }
    Ok(entries)
}

fn parse_line<'a, P, O>(mut parser: P, line: &'a str, line_no: usize) -> Result<O>
where
    P: combine::Parser<combine::easy::Stream<&'a str>, Output = O>,
{
    use combine::EasyParser;
    parser
        .easy_parse(line)
        .map(|(out, _remainder)| out)
        .map_err(|e| {
            // since converting combine's errors is a lifetime nightmare,
            // we just stringify the error before returning it.
            Error::Syntax {
                msg: format!("{}", e),
                line_no,
                line: line.to_owned(),
            }
            .into()
        })
}

pub mod prelude {
    pub use combine::parser::char::{char, string};
    pub use combine::parser::range::recognize;
    pub use combine::*;
}

mod util {
    use super::prelude::*;
    use crate::ast::KeyValue;

    // spaces and tabs only; lines are split before parsing.
    p! {
        inline_space() -> (), {
            skip_many(satisfy(|c: char| c == ' ' || c == '\t' || c == '\r'))
        }
    }

    wrapper! {
        lex_inline(parser), {
            inline_space().with(parser).skip(inline_space())
        }
    }

    p! {
        comment(markers: &'static str) -> (), {
            satisfy(move |c: char| markers.contains(c)).with(skip_many(any()))
        }
    }

    p! {
        key() -> &'a str, {
            recognize(skip_many1(satisfy(|c: char| {
                c.is_alphanumeric() || c == '_' || c == '.' || c == '-'
            })))
        }
    }

    // everything up to a comment marker; trailing whitespace is trimmed later.
    p! {
        value(markers: &'static str) -> &'a str, {
            recognize(skip_many(satisfy(move |c: char| !markers.contains(c))))
        }
    }

    p! {
        key_value(markers: &'static str) -> KeyValue<'a>, {
            (lex_inline(key()), char('='), inline_space(), value(markers))
                .map(|(key, _, _, val): (&'a str, char, (), &'a str)| KeyValue::new(key, val.trim()))
        }
    }

    #[cfg(test)]
    mod test {
        use anyhow::Result;
        use combine::EasyParser;

        use crate::ast::KeyValue;

        #[test]
        fn test_key() -> Result<()> {
            assert_eq!("ENCUT", super::key().easy_parse("ENCUT = 520").unwrap().0);
            assert_eq!("incar.ISMEAR", super::key().easy_parse("incar.ISMEAR").unwrap().0);
            assert!(super::key().easy_parse("= 3").is_err());
            Ok(())
        }

        #[test]
        fn test_key_value() -> Result<()> {
            assert_eq!(
                KeyValue::new("ISMEAR", "0"),
                super::key_value("#!").easy_parse("ISMEAR = 0 ! smearing").unwrap().0
            );
            assert_eq!(
                KeyValue::new("SYSTEM", "Fe bcc"),
                super::key_value("#!").easy_parse("SYSTEM=Fe bcc   ").unwrap().0
            );
            assert_eq!(
                KeyValue::new("re_to_parse_queue_id", "job <([0-9]+)> is submitted!"),
                super::key_value("#")
                    .easy_parse("re_to_parse_queue_id = job <([0-9]+)> is submitted!")
                    .unwrap()
                    .0
            );
            Ok(())
        }

        #[test]
        fn test_comment() -> Result<()> {
            assert_eq!(((), ""), super::comment("#!").easy_parse("! anything = here").unwrap());
            assert!(super::comment("#").easy_parse("! not a comment").is_err());
            Ok(())
        }
    }
}

mod key_values {
    use super::prelude::*;
    use super::util::{comment, key_value, lex_inline};
    use crate::ast::KeyValue;
    use crate::KEY_VALUE_COMMENTS;

    p! {
        line() -> Option<KeyValue<'a>>, {
            lex_inline(optional(key_value(KEY_VALUE_COMMENTS)))
                .skip(optional(comment(KEY_VALUE_COMMENTS)))
                .skip(eof())
        }
    }
}

mod workflow {
    use super::prelude::*;
    use super::util::{comment, key_value, lex_inline};
    use crate::ast::Line;
    use crate::WORKFLOW_COMMENTS;

    p! {
        block_marker() -> Line<'a>, {
            string("**").with(
                string("start").map(|_| Line::Start)
                    .or(string("end").map(|_| Line::End))
            )
        }
    }

    p! {
        line() -> Option<Line<'a>>, {
            lex_inline(optional(
                block_marker().or(key_value(WORKFLOW_COMMENTS).map(Line::Entry))
            ))
            .skip(optional(comment(WORKFLOW_COMMENTS)))
            .skip(eof())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const WORKFLOW: &str = "\
# two-step relaxation
**start
step_no = 1
cal_name = structure optimization  # trailing comment
**end

**start
  step_no = 2
  cal_name = scf
**end
";

    #[test]
    fn test_parse_workflow() -> Result<()> {
        let blocks = parse_workflow(WORKFLOW)?;
        assert_eq!(2, blocks.len());
        assert_eq!(2, blocks[0].line);
        assert_eq!(
            blocks[0].entries,
            vec![
                KeyValue::new("step_no", "1"),
                KeyValue::new("cal_name", "structure optimization"),
            ]
        );
        assert_eq!(7, blocks[1].line);
        assert_eq!(blocks[1].entries[1], KeyValue::new("cal_name", "scf"));
        Ok(())
    }

    #[test]
    fn test_workflow_block_errors() {
        assert!(parse_workflow("**start\nstep_no = 1\n").is_err());
        assert!(parse_workflow("**end\n").is_err());
        assert!(parse_workflow("step_no = 1\n").is_err());
        assert!(parse_workflow("**start\n**start\n**end\n").is_err());
    }

    #[test]
    fn test_parse_key_values() -> Result<()> {
        let text = "SYSTEM = Si\n\n# comment line\nENCUT = 520 ! cutoff\n  ISMEAR=0\n";
        let kvs = parse_key_values(text)?;
        assert_eq!(
            kvs,
            vec![
                KeyValue::new("SYSTEM", "Si"),
                KeyValue::new("ENCUT", "520"),
                KeyValue::new("ISMEAR", "0"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_key_values_bad_line() {
        let err = parse_key_values("ENCUT = 520\nnot a pair\n").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("line 2"), "{msg}");
    }
}
