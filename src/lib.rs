/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Domain Store - per-host DNS domain information store
//!
//! Passively snoops DNS responses, rebuilds CNAME chains and keeps a live
//! TTL-driven `name -> IP` cache so IP-only dataplanes can enforce
//! domain-based policy.

pub mod config;
pub mod core;
pub mod dataplane;
pub mod store;
