//! Output formatting for search results

use crate::index::context::IndexContext;
use roaring::RoaringBitmap;
use std::io::{self, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Print screening hits as `id<TAB>payload`, at most `limit` of them
pub fn print_hits(
    ctx: &IndexContext,
    hits: &RoaringBitmap,
    color: bool,
    limit: Option<usize>,
) -> io::Result<()> {
    let choice = if color {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    };
    let mut stdout = StandardStream::stdout(choice);

    let limit = limit.unwrap_or(usize::MAX);
    for id in hits.iter().take(limit) {
        stdout.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
        write!(stdout, "{}", id)?;
        stdout.reset()?;
        write!(stdout, "\t")?;

        match ctx.fetch(id) {
            Ok(Some(payload)) => {
                stdout.write_all(payload)?;
                writeln!(stdout)?;
            }
            Ok(None) => {
                stdout.set_color(ColorSpec::new().set_dimmed(true))?;
                writeln!(stdout, "(removed)")?;
                stdout.reset()?;
            }
            Err(e) => {
                stdout.set_color(ColorSpec::new().set_fg(Some(Color::Red)))?;
                writeln!(stdout, "(unavailable: {})", e)?;
                stdout.reset()?;
            }
        }
    }

    Ok(())
}

/// Print the candidate count line
pub fn print_summary(hits: &RoaringBitmap, total: usize, color: bool) -> io::Result<()> {
    let choice = if color {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    };
    let mut stderr = StandardStream::stderr(choice);

    stderr.set_color(ColorSpec::new().set_fg(Some(Color::Cyan)).set_bold(true))?;
    write!(stderr, "{}", hits.len())?;
    stderr.reset()?;
    let ratio = if total == 0 {
        0.0
    } else {
        hits.len() as f64 * 100.0 / total as f64
    };
    writeln!(stderr, " candidates of {} records ({:.2}%)", total, ratio)?;
    Ok(())
}
