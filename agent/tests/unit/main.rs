mod common;
mod test_client;
mod test_deployment;
mod test_http;
mod test_participants;
