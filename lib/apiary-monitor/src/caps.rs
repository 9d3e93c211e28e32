// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation between abstract feature names and the names a particular
//! hypervisor build exposes.
//!
//! A capability often ships first under an experimental prefix and later
//! stabilizes without it. Callers name the feature they want; resolution
//! toggles the prefix against the connection's supported-name set so they
//! never have to track where a given build is in that transition.

use std::collections::HashSet;

use thiserror::Error;

/// The reserved prefix experimental features carry.
pub const EXPERIMENTAL_PREFIX: &str = "x-";

/// Neither the stable nor the experimental spelling of a feature is
/// supported. Raised in strict mode only.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("capability {0} is supported in neither its stable nor its experimental spelling")]
pub struct CapabilityUnsupported(pub String);

/// Resolves `name` against `supported`.
///
/// With `allow_prefix_fallback` unset, or when `name` is already supported,
/// the name passes through unchanged. Otherwise the experimental prefix is
/// toggled and the other spelling is returned if supported. When both
/// spellings miss, strict mode fails with [`CapabilityUnsupported`];
/// permissive mode returns the original name unchanged so deliberately
/// unsupported requests can still be sent.
pub fn resolve(
    name: &str,
    supported: &HashSet<String>,
    allow_prefix_fallback: bool,
    strict: bool,
) -> Result<String, CapabilityUnsupported> {
    if !allow_prefix_fallback || supported.contains(name) {
        return Ok(name.to_owned());
    }

    let toggled = toggle_prefix(name);
    if supported.contains(&toggled) {
        return Ok(toggled);
    }

    if strict {
        Err(CapabilityUnsupported(name.to_owned()))
    } else {
        Ok(name.to_owned())
    }
}

/// Adds the experimental prefix if absent, removes it if present.
pub(crate) fn toggle_prefix(name: &str) -> String {
    match name.strip_prefix(EXPERIMENTAL_PREFIX) {
        Some(stable) => stable.to_owned(),
        None => format!("{EXPERIMENTAL_PREFIX}{name}"),
    }
}

/// Canonicalizes a command name for separator-insensitive comparison. The
/// human and structured variants disagree about `-` vs `_` in a handful of
/// command names.
pub(crate) fn normalize(name: &str) -> String {
    name.replace('_', "-")
}
