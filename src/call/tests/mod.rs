mod glare_test;
mod test_util;
