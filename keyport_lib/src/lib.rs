/**********************************************************************

Copyright (C) 2021 by reddal

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

**********************************************************************/

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]
#![allow(clippy::default_trait_access)]

mod prelude;

pub mod config;
pub mod crypto;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod shadowsocks;
pub mod stat;
pub mod utils;

pub use config::{AccessKey, ConfigSnapshot};
pub use server::{ApplyError, KeySet, Port, Server};
pub use stat::{Metrics, NopMetrics, Status};
pub use utils::BytesCount;
