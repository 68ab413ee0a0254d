mod init_test;
