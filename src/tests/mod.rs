//! Cross-cutting scenario tests wiring the full runtime together.


#[cfg(test)]
mod test_helpers;
