use std::fmt::Write;

use crate::PROFILE_URL_BASE;
use crate::types::{AlertText, ChangeEvent, ChangeReason, Record, RecordCategory, Side};

/// Maximum records rendered in one alert.
pub const PREVIEW_CAP: usize = 5;

/// Telegram rejects messages longer than this.
pub const MAX_ALERT_BYTES: usize = 4096;

const MARKET_WIDTH: usize = 80;
const OUTCOME_WIDTH: usize = 40;
const NAME_WIDTH: usize = 64;

/// Render a change as Telegram HTML.
///
/// Previews `new_records` (or the whole current snapshot when the change
/// has no new records, e.g. a closed position) capped at [`PREVIEW_CAP`],
/// followed by a single truncation line for the rest.
pub fn format_alert(event: &ChangeEvent) -> AlertText {
    let mut msg = String::new();
    let name = escape(&truncate(&event.entity.display_name, NAME_WIDTH));

    let _ = writeln!(msg, "🐋 <b>{name}</b> {}", headline(&event.reason));
    let _ = writeln!(
        msg,
        "📊 Total: {} | New: {}",
        event.current.len(),
        event.new_records.len()
    );

    if let ChangeReason::VolumeShift(shifts) = &event.reason {
        for s in shifts {
            let _ = writeln!(
                msg,
                "{} volume {:.2} → {:.2} ({:+.2}%)",
                book_side_label(s.side),
                s.before,
                s.after,
                signed_pct(s.before, s.after, s.change_pct),
            );
        }
    }

    let source: &[Record] = if event.new_records.is_empty() {
        &event.current.records
    } else {
        &event.new_records
    };

    if !source.is_empty() {
        msg.push('\n');
    }
    for (i, record) in source.iter().take(PREVIEW_CAP).enumerate() {
        render_record(&mut msg, i + 1, record);
    }
    if source.len() > PREVIEW_CAP {
        let _ = writeln!(msg, "\n… and {} more", source.len() - PREVIEW_CAP);
    }

    if event.entity.fetch_key.starts_with("0x") && event.entity.fetch_key.len() <= 66 {
        let _ = write!(
            msg,
            "\n🔗 <a href=\"{PROFILE_URL_BASE}/{}\">Profile</a>",
            event.entity.fetch_key
        );
    }

    AlertText(clamp_bytes(msg, MAX_ALERT_BYTES))
}

fn headline(reason: &ChangeReason) -> &'static str {
    match reason {
        ChangeReason::PositionsChanged => "changed positions!",
        ChangeReason::NewActivity => "has new activity!",
        ChangeReason::NewTrades => "just traded!",
        ChangeReason::VolumeShift(_) => "orderbook volume moved!",
    }
}

fn render_record(msg: &mut String, index: usize, r: &Record) {
    let market = escape(&truncate(&r.market, MARKET_WIDTH));
    let outcome = escape(&truncate(&r.outcome, OUTCOME_WIDTH));
    let label = side_label(r);
    let _ = writeln!(msg, "{index}. {label}<b>{market}</b>");
    let _ = writeln!(
        msg,
        "   → {outcome} | {:.2} @ ${:.4} = ${:.2}",
        r.amount,
        r.price,
        r.notional()
    );
}

fn side_label(r: &Record) -> &'static str {
    match (r.category, r.side) {
        (RecordCategory::VolumeSample, Some(side)) => match side {
            Side::Buy => "Bid ",
            Side::Sell => "Ask ",
        },
        (_, Some(Side::Buy)) => "🟢 Buy ",
        (_, Some(Side::Sell)) => "🔴 Sell ",
        (_, None) => "",
    }
}

fn book_side_label(side: Side) -> &'static str {
    match side {
        Side::Buy => "Bids",
        Side::Sell => "Asks",
    }
}

fn signed_pct(before: f64, after: f64, pct: f64) -> f64 {
    if after < before { -pct } else { pct }
}

/// Truncate to `max` chars, marking the cut with an ellipsis.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Escape the three characters Telegram's HTML mode treats specially.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Cut to at most `max` bytes on a char boundary.
fn clamp_bytes(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}
