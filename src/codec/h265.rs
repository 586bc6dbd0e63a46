// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod params;
pub mod picture;
pub mod rps;
pub mod slice;
