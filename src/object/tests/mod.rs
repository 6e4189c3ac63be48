mod tests_value;
