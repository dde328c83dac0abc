// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Component implementations.
//!
//! Real components are provided by vendor libraries through a `ComponentLoader`. This module only
//! contains a dummy component that behaves like a hardware decoder, so the adapter can be tested
//! in isolation.

#[cfg(test)]
pub(crate) mod dummy;
