// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of newsfeed.
//
// newsfeed is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// newsfeed is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with newsfeed.  If not,
// see <http://www.gnu.org/licenses/>.

//! # util
//!
//! Odds & ends without an obvious home.

use std::fmt::Display;

use secrecy::SecretString;
use serde::Deserialize;
use tap::Pipe;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          exactly_two                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// How an iterator failed to produce exactly two items
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExactlyTwoError {
    Empty,
    One,
    ThreeOrMore,
}

impl Display for ExactlyTwoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExactlyTwoError::Empty => write!(f, "expected two elements, got none"),
            ExactlyTwoError::One => write!(f, "expected two elements, got one"),
            ExactlyTwoError::ThreeOrMore => write!(f, "expected two elements, got three or more"),
        }
    }
}

impl std::error::Error for ExactlyTwoError {}

/// Pull exactly two items from `iter`
pub fn exactly_two<T: Iterator>(mut iter: T) -> Result<(T::Item, T::Item), ExactlyTwoError> {
    let first = iter.next().ok_or(ExactlyTwoError::Empty)?;
    let second = iter.next().ok_or(ExactlyTwoError::One)?;
    match iter.next() {
        Some(_) => Err(ExactlyTwoError::ThreeOrMore),
        None => Ok((first, second)),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      generic credentials                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Username & password, given on the command line as "user,password"
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials(pub (SecretString, SecretString));

impl clap::builder::ValueParserFactory for Credentials {
    type Parser = CredentialsParser;

    fn value_parser() -> Self::Parser {
        CredentialsParser
    }
}

#[derive(Clone, Debug)]
pub struct CredentialsParser;

impl clap::builder::TypedValueParser for CredentialsParser {
    type Value = Credentials;

    fn parse_ref(
        &self,
        _cmd: &clap::Command,
        _arg: Option<&clap::Arg>,
        value: &std::ffi::OsStr,
    ) -> std::result::Result<Self::Value, clap::Error> {
        use clap::error::ErrorKind;
        value
            .to_str()
            .ok_or(clap::Error::new(ErrorKind::InvalidUtf8))?
            .split(',')
            .pipe(exactly_two)
            .map_err(|_| clap::Error::new(ErrorKind::WrongNumberOfValues))?
            .pipe(|(user, pass)| Credentials((user.into(), pass.into())))
            .pipe(Ok)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use secrecy::ExposeSecret;

    #[test]
    fn two() {
        assert_eq!(exactly_two("cf:post_id".split(':')), Ok(("cf", "post_id")));
        assert_eq!(exactly_two("".split(',').skip(1)), Err(ExactlyTwoError::Empty));
        assert_eq!(exactly_two("a".split(',')), Err(ExactlyTwoError::One));
        assert_eq!(exactly_two("a,b,c".split(',')), Err(ExactlyTwoError::ThreeOrMore));
    }

    #[test]
    fn credentials() {
        use clap::builder::TypedValueParser;
        let cmd = clap::Command::new("test");
        let creds = CredentialsParser
            .parse_ref(&cmd, None, std::ffi::OsStr::new("scylla,s3kr1t"))
            .unwrap();
        assert_eq!(creds.0.0.expose_secret(), "scylla");
        assert_eq!(creds.0.1.expose_secret(), "s3kr1t");
        assert!(CredentialsParser
            .parse_ref(&cmd, None, std::ffi::OsStr::new("scylla"))
            .is_err());
    }
}
