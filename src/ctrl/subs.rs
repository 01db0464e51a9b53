//! `subscribe` / `unsubscribe` command-line helpers.
//!
//! Modules that consume feeds bind them to named roles ("usages") so a
//! command line can rewire a module's inputs at runtime:
//!
//! ```text
//! command wfmd.config.in "subscribe iq soapy.IQ-info"
//! command wfmd.config.in "unsubscribe iq"
//! ```
//!
//! These helpers parse the line, invoke the module's callback to perform
//! the actual rewiring, and emit the conventional ok/err reply. They return
//! `true` when the line was recognized (even if it failed), so the module's
//! command handler can fall through to its own verbs otherwise.

use anyhow::Result;

use super::CtrlContext;

/// Handle a `subscribe <usage> <feed>` line.
///
/// `bind` performs the module-side rewiring (typically a broker
/// `subscribe` plus a slot update); its error message is reported to
/// `config.out`.
pub fn handle_subscribe_cmd(
    ctx: &CtrlContext,
    line: &str,
    bind: impl FnOnce(&str, &str) -> Result<()>,
) -> Result<bool> {
    let Some(rest) = line.strip_prefix("subscribe") else {
        return Ok(false);
    };
    let mut words = rest.split_whitespace();
    let (Some(usage), Some(feed)) = (words.next(), words.next()) else {
        ctx.reply_err("subscribe <usage> <feed>")?;
        return Ok(true);
    };
    match bind(usage, feed) {
        Ok(()) => ctx.reply_ok(&format!("subscribed {usage} {feed}"))?,
        Err(e) => ctx.reply_err(&format!("subscribe failed: {e}"))?,
    }
    Ok(true)
}

/// Handle an `unsubscribe <usage>` line.
pub fn handle_unsubscribe_cmd(
    ctx: &CtrlContext,
    line: &str,
    unbind: impl FnOnce(&str) -> Result<()>,
) -> Result<bool> {
    let Some(rest) = line.strip_prefix("unsubscribe") else {
        return Ok(false);
    };
    let Some(usage) = rest.split_whitespace().next() else {
        ctx.reply_err("unsubscribe <usage>")?;
        return Ok(true);
    };
    match unbind(usage) {
        Ok(()) => ctx.reply_ok(&format!("unsubscribed {usage}"))?,
        Err(e) => ctx.reply_err(&format!("unsubscribe failed: {e}"))?,
    }
    Ok(true)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
