mod tests_random;
mod tests_rehash;
