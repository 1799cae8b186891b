error_chain! {
	foreign_links {
		Io(::std::io::Error);
		Sqlite(::rusqlite::Error);
		Json(::serde_json::Error);
		Raft(::raft::errors::Error);
		Toml(::toml::de::Error);
	}

	errors {
		/// `cmd.Repository` named something no registered router target handles.
		UnknownRepository(name: String) {
			description("unknown repository")
			display("unknown repository: {}", name)
		}

		/// `cmd.Method` isn't defined for the repository it was addressed to.
		UnknownMethod(repository: String, method: String) {
			description("unknown method for repository")
			display("unknown method {} for repository {}", method, repository)
		}

		/// The row a write addressed by id/name doesn't exist.
		NotFound(what: String) {
			description("not found")
			display("not found: {}", what)
		}
	}
}
