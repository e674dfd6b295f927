/*
 * aspect.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Locanda, an embeddable HTTP server library.
 *
 * Locanda is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Locanda is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Locanda.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Handler aspects: before/after pairs wrapping the terminal handler.
//! `before` runs in declaration order and may short-circuit; `after` runs in
//! reverse order, only for aspects whose `before` was invoked, and may
//! mutate the response but not the request.

use std::sync::Arc;

use crate::protocol::http::request::Request;
use crate::protocol::http::response::Response;
use crate::protocol::http::router::HandlerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectOutcome {
    Continue,
    /// Skip remaining `before` calls and the terminal handler.
    ShortCircuit,
}

/// One middleware aspect. Defaults make each side optional.
pub trait Aspect: Send + Sync {
    fn before(&self, _req: &mut Request, _res: &mut Response) -> Result<AspectOutcome, HandlerError> {
        Ok(AspectOutcome::Continue)
    }

    fn after(&self, _req: &Request, _res: &mut Response) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Non-fatal aspects have failures logged and skipped instead of
    /// failing the request with a 500.
    fn non_fatal(&self) -> bool {
        false
    }

    /// Shown in failure logs.
    fn name(&self) -> &str {
        "aspect"
    }
}

/// Result of the before phase: how many aspects were invoked (and therefore
/// owe an `after`), and whether the terminal handler should run.
pub struct BeforeOutcome {
    pub invoked: usize,
    pub run_terminal: bool,
}

/// Run `before` in declaration order. A fatal failure aborts immediately;
/// non-fatal failures count as Continue.
pub fn run_before(
    aspects: &[Arc<dyn Aspect>],
    req: &mut Request,
    res: &mut Response,
) -> Result<BeforeOutcome, HandlerError> {
    for (i, aspect) in aspects.iter().enumerate() {
        match aspect.before(req, res) {
            Ok(AspectOutcome::Continue) => {}
            Ok(AspectOutcome::ShortCircuit) => {
                return Ok(BeforeOutcome {
                    invoked: i + 1,
                    run_terminal: false,
                });
            }
            Err(e) if aspect.non_fatal() => {
                log::warn!("non-fatal aspect {} failed in before: {}", aspect.name(), e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(BeforeOutcome {
        invoked: aspects.len(),
        run_terminal: true,
    })
}

/// Run `after` in reverse order over the first `invoked` aspects.
pub fn run_after(
    aspects: &[Arc<dyn Aspect>],
    invoked: usize,
    req: &Request,
    res: &mut Response,
) -> Result<(), HandlerError> {
    for aspect in aspects[..invoked.min(aspects.len())].iter().rev() {
        match aspect.after(req, res) {
            Ok(()) => {}
            Err(e) if aspect.non_fatal() => {
                log::warn!("non-fatal aspect {} failed in after: {}", aspect.name(), e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
