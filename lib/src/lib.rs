// Copyright 2022 The Arbor Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(unused_must_use)]

pub mod cross_field;
pub mod delta;
pub mod detached;
pub mod edit_manager;
pub mod enricher;
pub mod field_kind;
pub mod forest;
pub mod id_compressor;
pub mod modular;
pub mod optional_field;
pub mod range_map;
pub mod revision;
pub mod schema;
pub mod sequence_field;
pub mod summary;
pub mod tree;
