// Copyright (c) Pgvault Contributors
// SPDX-License-Identifier: Apache-2.0

//! Test utilities shared between the pgvault crates.

/// A result type useful in tests, that wraps any error implementation.
pub type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Macro for creating parametrized *synchronous* tests.
///
/// The `param_test!` macro accepts the name of an existing function, followed
/// by a list of case names and their arguments. It expands to a module with a
/// `#[test]` function for each of the cases. Each test case calls the
/// existing, named function with their provided arguments.
///
/// See [`async_param_test`] for a similar macro that works with `async`
/// functions.
///
/// # Examples
///
/// ```
/// # use pgvault_test_utils::param_test;
/// #
/// param_test! {
///     test_sum: [
///         positive_sums: (10, 7, 17),
///         negative_sums: (-5, -3, -8),
///     ]
/// }
/// fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// ```
///
/// Test functions can also have return types, such as a [`Result`]:
///
/// ```
/// # use std::error::Error;
/// # use pgvault_test_utils::param_test;
/// #
/// param_test! {
///     test_parses -> Result<(), Box<dyn Error>>: [
///         positive: ("21", 21),
///         negative: ("-17", -17),
///     ]
/// }
/// fn test_parses(to_parse: &str, expected: i32) -> Result<(), Box<dyn Error>> {
///     assert_eq!(expected, to_parse.parse::<i32>()?);
///     Ok(())
/// }
/// ```
///
/// Attributes such as `#[ignore]` may be added to individual cases:
///
/// ```
/// # use pgvault_test_utils::param_test;
/// #
/// param_test! {
///     test_sum: [
///         #[ignore] positive_sums: (10, 7, 17),
///         negative_sums: (-5, -3, -8),
///     ]
/// }
/// fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// ```
#[macro_export]
macro_rules! param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[test]
                $(#[$outer])*
                fn $case_name() -> $return_ty {
                    $func_name($($args),*)
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::param_test!(
            $func_name -> ():
            [ $( $(#[$outer])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}

/// Macro for creating parametrized *asynchronous* tests.
///
/// This macro behaves like [`param_test`], but must be used with an `async`
/// function; the cases expand with the `#[tokio::test]` attribute.
///
/// ```
/// # use pgvault_test_utils::async_param_test;
/// #
/// async_param_test! {
///     doubles: [
///         two: (2, 4),
///         seven: (7, 14),
///     ]
/// }
/// async fn doubles(input: u32, expected: u32) {
///     assert_eq!(input * 2, expected);
/// }
/// ```
#[macro_export]
macro_rules! async_param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[tokio::test]
                $(#[$outer])*
                async fn $case_name() -> $return_ty {
                    $func_name($($args),*).await
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::async_param_test!(
            $func_name -> ():
            [ $( $(#[$outer])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}
