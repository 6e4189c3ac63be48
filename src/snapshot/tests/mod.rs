mod helpers;

mod tests_fanout;
mod tests_roundtrip;
mod tests_strings;
