use std::time;

pub trait Authenticator: Send + Sync {
  // Ok(false) for rejected credentials, Err when no decision could be reached.
  fn authenticate(&self, user: &str, password: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Default)]
pub struct AcceptAll;

impl Authenticator for AcceptAll {
  fn authenticate(&self, _: &str, _: &str) -> anyhow::Result<bool> {
    Ok(true)
  }
}

// Posts {"email": ..., "password": ...} to an HTTP(S) endpoint, only a 200 lets the user in.
pub struct Remote {
  agent: ureq::Agent,
  url: String,
  domain: String,
}

impl Remote {
  pub fn new(url: &str, domain: &str, verify: bool) -> anyhow::Result<Self> {
    let tls = if verify {
      crate::tls::native_client_config()?
    } else {
      crate::tls::insecure_client_config()
    };
    Ok(Self {
      agent: ureq::AgentBuilder::new()
        .tls_config(tls)
        .timeout(time::Duration::from_secs(10))
        .build(),
      url: url.to_string(),
      domain: domain.to_string(),
    })
  }

  fn email(&self, user: &str) -> String {
    if user.contains('@') || self.domain.is_empty() {
      user.to_string()
    } else {
      format!("{user}@{}", self.domain)
    }
  }
}

impl Authenticator for Remote {
  fn authenticate(&self, user: &str, password: &str) -> anyhow::Result<bool> {
    let email = self.email(user);
    match self
      .agent
      .post(&self.url)
      .send_json(ureq::json!({ "email": email, "password": password }))
    {
      Ok(response) => Ok(response.status() == 200),
      Err(ureq::Error::Status(status, _)) => {
        log::debug!("{} refused {email} with {status}", self.url);
        Ok(false)
      }
      Err(error @ ureq::Error::Transport(_)) => {
        Err(anyhow::Error::new(error).context(format!("couldn't reach {}", self.url)))
      }
    }
  }
}
