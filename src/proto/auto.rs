// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Auto-detect dispatcher (module I): peek the first byte and hand off to
//! SOCKS5 or HTTP accordingly, so one listening port serves both.

use crate::error::CoreError;
use crate::request::Request;
use crate::stream::Stream;

const SOCKS5_VERSION: u8 = 0x05;

pub async fn accept(mut stream: Box<dyn Stream>) -> Result<Request, CoreError> {
    let first = crate::scoped_close!(
        stream,
        async {
            let peeked = stream.peek().await?;
            peeked
                .first()
                .copied()
                .ok_or_else(|| CoreError::protocol("auto", "connection closed before any byte"))
        }
    )?;

    if first == SOCKS5_VERSION {
        crate::proto::socks5::accept(stream).await
    } else {
        crate::proto::http::accept(stream).await
    }
}
