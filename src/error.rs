// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt::{Debug, Formatter, Result};

/// POSIX errno
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code, clippy::upper_case_acronyms)]
pub enum EpcErrorNum {
    EINTR = 4,
    EIO = 5,
    ENOMEM = 12,
    EFAULT = 14,
    EBUSY = 16,
    ENODEV = 19,
    EINVAL = 22,
}

pub struct EpcError {
    num: EpcErrorNum,
    loc_file: &'static str,
    loc_line: u32,
    loc_col: u32,
    msg: Option<String>,
}

pub type EpcResult<T = ()> = core::result::Result<T, EpcError>;

impl EpcErrorNum {
    pub fn as_str(&self) -> &'static str {
        use EpcErrorNum::*;
        match *self {
            EINTR => "Interrupted system call",
            EIO => "I/O error",
            ENOMEM => "Out of memory",
            EFAULT => "Bad address",
            EBUSY => "Device or resource busy",
            ENODEV => "No such device",
            EINVAL => "Invalid argument",
        }
    }

    pub fn code(&self) -> i32 {
        -(*self as u32 as i32)
    }
}

impl EpcError {
    pub fn new(
        num: EpcErrorNum,
        loc_file: &'static str,
        loc_line: u32,
        loc_col: u32,
        msg: Option<String>,
    ) -> Self {
        Self {
            num,
            loc_file,
            loc_line,
            loc_col,
            msg,
        }
    }

    pub fn num(&self) -> EpcErrorNum {
        self.num
    }

    pub fn msg(&self) -> Option<String> {
        self.msg.as_ref().map(|string| string.into())
    }

    pub fn code(&self) -> i32 {
        self.num.code()
    }
}

impl Debug for EpcError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(
            f,
            "[{}:{}:{}] {}",
            self.loc_file,
            self.loc_line,
            self.loc_col,
            self.num.as_str()
        )?;
        if let Some(ref msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! epc_err {
    ($num: ident) => {{
        use $crate::error::{EpcError, EpcErrorNum::*};
        EpcError::new($num, file!(), line!(), column!(), None)
    }};
    ($num: ident, $msg: expr) => {{
        use $crate::error::{EpcError, EpcErrorNum::*};
        EpcError::new($num, file!(), line!(), column!(), Some($msg.into()))
    }};
}

#[macro_export]
macro_rules! epc_result_err {
    ($num: ident) => {
        Err($crate::epc_err!($num))
    };
    ($num: ident, $msg: expr) => {
        Err($crate::epc_err!($num, $msg))
    };
}
